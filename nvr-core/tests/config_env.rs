//! Environment overrides layered over a config file.

use nvr_core::config::HlsPolicy;
use nvr_core::Config;

#[test]
fn test_env_overrides_file_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        "broker:\n  api_port: 2000\nrecording:\n  hls_policy: broker\n",
    )
    .unwrap();

    std::env::set_var("NVR__BROKER__API_PORT", "3000");
    std::env::set_var("NVR__RECORDING__FORCE_NATIVE_HLS", "true");
    let config = Config::from_file(path.to_str().unwrap()).unwrap();
    std::env::remove_var("NVR__BROKER__API_PORT");
    std::env::remove_var("NVR__RECORDING__FORCE_NATIVE_HLS");

    assert_eq!(config.broker.api_port, 3000);
    assert_eq!(config.recording.hls_policy, HlsPolicy::Broker);
    assert_eq!(config.recording.effective_hls_policy(), HlsPolicy::Native);
}
