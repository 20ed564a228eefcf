use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use teachable_kernel::config::SessionConfig;
use teachable_kernel::TensorLayout;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "TEACHABLE_CONFIG",
        "TEACHABLE_MODEL_REF",
        "TEACHABLE_SOURCE_URL",
        "TEACHABLE_EPOCHS",
        "TEACHABLE_BATCH_SIZE",
        "TEACHABLE_LEARNING_RATE",
        "TEACHABLE_CAPTURE_INTERVAL_MS",
        "TEACHABLE_PREDICT_INTERVAL_MS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(suffix: &str, body: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    std::io::Write::write_all(&mut file, body.as_bytes()).expect("write config");
    file
}

#[test]
fn defaults_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = SessionConfig::load().expect("load config");

    assert_eq!(cfg.model.reference, "builtin:histogram");
    assert_eq!((cfg.model.input.width, cfg.model.input.height), (224, 224));
    assert_eq!(cfg.model.layout, TensorLayout::Nhwc);
    assert_eq!(cfg.source.url, "stub://camera");
    assert_eq!((cfg.source.width, cfg.source.height), (640, 480));
    assert_eq!(cfg.capture_interval, Duration::from_millis(40));
    assert_eq!(cfg.predict_interval, Duration::from_millis(100));
    assert_eq!(cfg.training.epochs, 10);
    assert_eq!(cfg.training.batch_size, 5);
    assert!((cfg.training.learning_rate - 0.001).abs() < f32::EPSILON);
    assert_eq!(cfg.training.hidden_units, 128);
    assert_eq!(cfg.training.seed, None);
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".json",
        r#"{
            "model": {
                "reference": "models/mobilenet.onnx",
                "input_width": 160,
                "input_height": 128,
                "layout": "nchw"
            },
            "source": { "url": "v4l2:///dev/video2", "width": 800, "height": 600 },
            "capture": { "interval_ms": 25 },
            "predict": { "interval_ms": 250 },
            "training": { "epochs": 20, "batch_size": 8, "hidden_units": 64, "seed": 42 }
        }"#,
    );

    std::env::set_var("TEACHABLE_CONFIG", file.path());
    std::env::set_var("TEACHABLE_SOURCE_URL", "stub://desk");
    std::env::set_var("TEACHABLE_LEARNING_RATE", "0.01");
    std::env::set_var("TEACHABLE_PREDICT_INTERVAL_MS", "50");

    let cfg = SessionConfig::load().expect("load config");

    assert_eq!(cfg.model.reference, "models/mobilenet.onnx");
    assert_eq!((cfg.model.input.width, cfg.model.input.height), (160, 128));
    assert_eq!(cfg.model.layout, TensorLayout::Nchw);
    assert_eq!(cfg.source.url, "stub://desk");
    assert_eq!((cfg.source.width, cfg.source.height), (800, 600));
    assert_eq!(cfg.capture_interval, Duration::from_millis(25));
    assert_eq!(cfg.predict_interval, Duration::from_millis(50));
    assert_eq!(cfg.training.epochs, 20);
    assert_eq!(cfg.training.batch_size, 8);
    assert!((cfg.training.learning_rate - 0.01).abs() < f32::EPSILON);
    assert_eq!(cfg.training.hidden_units, 64);
    assert_eq!(cfg.training.seed, Some(42));

    let settings = cfg.session_settings();
    assert_eq!(settings.capture_interval, cfg.capture_interval);
    assert_eq!(settings.training, cfg.training);

    clear_env();
}

#[test]
fn toml_files_are_accepted() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        ".toml",
        r#"
            [model]
            reference = "https://models.example/embed.onnx"

            [training]
            epochs = 3
        "#,
    );

    let cfg = SessionConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.model.reference, "https://models.example/embed.onnx");
    assert_eq!(cfg.training.epochs, 3);
    assert_eq!(cfg.training.batch_size, 5);
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("TEACHABLE_EPOCHS", "0");
    assert!(SessionConfig::load().is_err());
    clear_env();

    std::env::set_var("TEACHABLE_BATCH_SIZE", "several");
    let err = SessionConfig::load().unwrap_err();
    assert!(err.to_string().contains("TEACHABLE_BATCH_SIZE"));
    clear_env();

    std::env::set_var("TEACHABLE_LEARNING_RATE", "-0.5");
    assert!(SessionConfig::load().is_err());
    clear_env();

    let file = write_config(".json", r#"{ "capture": { "interval_ms": 0 } }"#);
    assert!(SessionConfig::load_from(Some(file.path())).is_err());

    let file = write_config(".json", r#"{ "model": { "reference": "  " } }"#);
    assert!(SessionConfig::load_from(Some(file.path())).is_err());

    let file = write_config(".json", r#"{ "retention": { "seconds": 10 } }"#);
    assert!(SessionConfig::load_from(Some(file.path())).is_err());
}
