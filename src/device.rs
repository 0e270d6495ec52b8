use crate::platform::Platform;
use log::info;
use uuid::Uuid;

/// Resolve the device id: configured value first, then the probe's hardware
/// identity, then a random UUID.
pub fn resolve_device_id(configured: &str, platform: &dyn Platform) -> String {
    if !configured.is_empty() {
        info!("Using configured device ID: device_id={configured}");
        return configured.to_string();
    }

    match platform.device_identity() {
        Ok(id) if !id.is_empty() && id != "unknown-device" => {
            info!("Using platform device ID: device_id={id}");
            id
        }
        _ => {
            let id = Uuid::new_v4().to_string();
            info!("Generated device ID: device_id={id}");
            id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{ActivitySink, SystemInfo, WindowInfo};
    use anyhow::Result;

    struct IdentityPlatform(Result<String>);

    impl Platform for IdentityPlatform {
        fn active_window(&self) -> Result<WindowInfo> {
            anyhow::bail!("unused")
        }
        fn start_input_monitoring(&self, _sink: ActivitySink) -> Result<()> {
            Ok(())
        }
        fn stop_input_monitoring(&self) {}
        fn device_identity(&self) -> Result<String> {
            match &self.0 {
                Ok(id) => Ok(id.clone()),
                Err(_) => anyhow::bail!("no identity"),
            }
        }
        fn system_info(&self) -> Result<SystemInfo> {
            anyhow::bail!("unused")
        }
        fn open_browser(&self, _url: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn configured_id_wins() {
        let platform = IdentityPlatform(Ok("hw-id".into()));
        assert_eq!(resolve_device_id("configured", &platform), "configured");
    }

    #[test]
    fn platform_identity_is_second_choice() {
        let platform = IdentityPlatform(Ok("hw-id".into()));
        assert_eq!(resolve_device_id("", &platform), "hw-id");
    }

    #[test]
    fn falls_back_to_uuid() {
        for platform in [
            IdentityPlatform(Err(anyhow::anyhow!("none"))),
            IdentityPlatform(Ok("unknown-device".into())),
        ] {
            let id = resolve_device_id("", &platform);
            assert!(Uuid::parse_str(&id).is_ok(), "not a uuid: {id}");
        }
    }
}
