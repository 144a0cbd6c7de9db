use std::io::Write;

use stonewire::{AppError, AppResult, StoneWireConfig, DEFAULT_PORT};
use tempfile::Builder;

fn write_conf(contents: &str) -> AppResult<tempfile::NamedTempFile> {
    let mut file = Builder::new().suffix(".toml").tempfile()?;
    file.write_all(contents.as_bytes())?;
    file.flush()?;
    Ok(file)
}

#[test]
fn test_load_network_section() -> AppResult<()> {
    let file = write_conf(
        r#"
[network]
ip = "0.0.0.0"
port = 7000
send_timeout_ms = 250
max_accept_backoff_secs = 8
"#,
    )?;
    let config = StoneWireConfig::set_up_config(file.path())?;
    assert_eq!(config.network.ip, "0.0.0.0");
    assert_eq!(config.network.port, 7000);
    assert_eq!(config.network.send_timeout_ms, 250);
    assert_eq!(config.network.max_accept_backoff_secs, 8);
    Ok(())
}

#[test]
fn test_missing_keys_fall_back_to_defaults() -> AppResult<()> {
    let file = write_conf("[network]\nip = \"10.0.0.1\"\n")?;
    let config = StoneWireConfig::set_up_config(file.path())?;
    assert_eq!(config.network.ip, "10.0.0.1");
    assert_eq!(config.network.port, DEFAULT_PORT);
    assert_eq!(config.network.send_timeout_ms, 5000);
    Ok(())
}

#[test]
fn test_invalid_values_are_rejected() -> AppResult<()> {
    let file = write_conf("[network]\nsend_timeout_ms = 0\n")?;
    let result = StoneWireConfig::set_up_config(file.path());
    assert!(matches!(result, Err(AppError::InvalidValue(_))));
    Ok(())
}

#[test]
fn test_missing_file_is_config_error() {
    let result = StoneWireConfig::set_up_config("/nonexistent/stonewire/conf.toml");
    assert!(matches!(result, Err(AppError::ConfigFileError(_))));
}
