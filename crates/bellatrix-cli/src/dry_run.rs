//! Canned devices for `--mock` runs.

use std::sync::Arc;

use bellatrix_devices::mock::{responder, MockPortProvider};

/// Reply a typical handset gives to `instruction`
fn reply(port: &str, instruction: &str) -> Vec<String> {
    let serial = port.chars().filter(char::is_ascii_alphanumeric).collect::<String>();
    let upper = instruction.to_ascii_uppercase();

    if upper.starts_with("AT+DEVCONINFO") {
        vec![
            format!(
                "\r\n+DEVCONINFO: MN(SM-G973U);BASE(SM-G973U);VER(G973USQU4FUD1);\
                 PRD(TMB);SN(R58M{serial});IMEI(35{:013});CON(AT,MTP);LOCK(NONE);\r\n",
                serial.len() * 7919
            ),
            "#OK#\r\n\r\nOK\r\n".to_string(),
        ]
    } else if upper.starts_with("AT+VERSNAME") {
        vec!["\r\n+VERSNAME:3,11\r\n\r\nOK\r\n".to_string()]
    } else if upper.starts_with("AT+SVCIFPGM") {
        vec!["\r\n+SVCIFPGM:1,4,UNLOCK,OK\r\n".to_string()]
    } else if upper.starts_with("AT+REACTIVE") {
        vec!["\r\n+REACTIVE:1,UNLOCK\r\n\r\nOK\r\n".to_string()]
    } else if upper.starts_with("AT") {
        vec!["\r\nOK\r\n".to_string()]
    } else {
        vec!["\r\nERROR\r\n".to_string()]
    }
}

/// Provider exposing an in-memory handset on each port
pub fn provider(ports: &[String]) -> Arc<MockPortProvider> {
    let provider = MockPortProvider::new(ports.iter().cloned());
    provider.set_responder(responder(reply));
    Arc::new(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bellatrix_devices::{LockState, ResponseParser};

    #[test]
    fn test_replies_parse_into_telemetry() {
        let parser = ResponseParser::new();
        let mut info = bellatrix_devices::DeviceInfo::new("COM3");
        for instruction in ["AT+DEVCONINFO", "AT+VERSNAME=3,2,3", "AT+SVCIFPGM=1,4", "AT+REACTIVE=1,0,0"] {
            let text = reply("COM3", instruction).concat();
            info.apply(&parser.parse(&text).updates);
        }
        assert_eq!(info.model_no.as_deref(), Some("SM-G973U"));
        assert_eq!(info.serial_no.as_deref(), Some("R58MCOM3"));
        assert_eq!(info.android_version.as_deref(), Some("11"));
        assert_eq!(info.network_lock, LockState::Unlocked);
        assert_eq!(info.activation_lock, LockState::Unlocked);
    }

    #[test]
    fn test_unknown_text_is_an_error() {
        assert_eq!(reply("COM1", "hello"), vec!["\r\nERROR\r\n"]);
    }
}
