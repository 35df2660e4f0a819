//! Serial command vocabulary understood by the MicroClaw firmware.
//!
//! Commands are single text lines: a verb followed by arguments. Arguments
//! that may contain spaces are wrapped in double quotes; the firmware parser
//! has no escape syntax, so a value containing `"` or a line break cannot be
//! sent at all.
//!
//! ```text
//! wifi_set "<ssid>" "<password>"
//! set_tg_token "<token>"
//! set_api_key "<key>"
//! set_provider "<name>"
//! system_info
//! ```

use std::fmt;

use thiserror::Error;

use crate::config::DeviceConfig;

/// Errors raised while encoding a command for the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// An argument cannot be represented inside a quoted firmware argument.
    #[error("argument for {command} contains a quote or line break")]
    UnencodableArgument { command: &'static str },
}

/// A command the firmware CLI accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Store Wi-Fi credentials. The device reboots to apply them.
    WifiSet { ssid: String, password: String },
    /// Store the Telegram bot token.
    SetTelegramToken(String),
    /// Store the Gemini API key.
    SetApiKey(String),
    /// Store the Groq API key.
    SetGroqKey(String),
    /// Select the assistant provider (`gemini` or `groq`).
    SetProvider(String),
    /// Request a status payload.
    SystemInfo,
    /// Print the stored configuration.
    ConfigShow,
    /// Reboot the device.
    Restart,
    /// Scan for Wi-Fi networks.
    WifiScan,
}

impl DeviceCommand {
    /// The command verb.
    pub fn verb(&self) -> &'static str {
        match self {
            DeviceCommand::WifiSet { .. } => "wifi_set",
            DeviceCommand::SetTelegramToken(_) => "set_tg_token",
            DeviceCommand::SetApiKey(_) => "set_api_key",
            DeviceCommand::SetGroqKey(_) => "set_groq_key",
            DeviceCommand::SetProvider(_) => "set_provider",
            DeviceCommand::SystemInfo => "system_info",
            DeviceCommand::ConfigShow => "config_show",
            DeviceCommand::Restart => "restart",
            DeviceCommand::WifiScan => "wifi_scan",
        }
    }

    /// Encode as a command line, without the trailing newline.
    pub fn encode(&self) -> Result<String, CommandError> {
        let verb = self.verb();
        let args: Vec<&str> = match self {
            DeviceCommand::WifiSet { ssid, password } => vec![ssid.as_str(), password.as_str()],
            DeviceCommand::SetTelegramToken(value)
            | DeviceCommand::SetApiKey(value)
            | DeviceCommand::SetGroqKey(value)
            | DeviceCommand::SetProvider(value) => vec![value.as_str()],
            DeviceCommand::SystemInfo
            | DeviceCommand::ConfigShow
            | DeviceCommand::Restart
            | DeviceCommand::WifiScan => Vec::new(),
        };

        let mut line = verb.to_string();
        for arg in args {
            if arg.contains(['"', '\n', '\r']) {
                return Err(CommandError::UnencodableArgument { command: verb });
            }
            line.push_str(" \"");
            line.push_str(arg);
            line.push('"');
        }
        Ok(line)
    }

    /// Whether the device is expected to reboot after this command.
    pub fn triggers_reboot(&self) -> bool {
        matches!(self, DeviceCommand::WifiSet { .. } | DeviceCommand::Restart)
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.encode() {
            Ok(line) => f.write_str(&line),
            Err(_) => write!(f, "{} <unencodable>", self.verb()),
        }
    }
}

/// Ordered command sequence restoring `config` on a freshly flashed device.
///
/// Tokens and provider keys go first; Wi-Fi credentials are always last
/// because applying them reboots the device. Empty values are skipped.
pub fn replay_commands(config: &DeviceConfig) -> Vec<DeviceCommand> {
    let mut commands = Vec::new();

    if !config.telegram_token.is_empty() {
        commands.push(DeviceCommand::SetTelegramToken(config.telegram_token.clone()));
    }
    if !config.gemini_key.is_empty() {
        commands.push(DeviceCommand::SetApiKey(config.gemini_key.clone()));
    }
    if !config.groq_key.is_empty() {
        commands.push(DeviceCommand::SetGroqKey(config.groq_key.clone()));
    }
    if !config.assistant_provider.is_empty() {
        commands.push(DeviceCommand::SetProvider(config.assistant_provider.clone()));
    }
    if !config.wifi_ssid.is_empty() {
        commands.push(DeviceCommand::WifiSet {
            ssid: config.wifi_ssid.clone(),
            password: config.wifi_password.clone(),
        });
    }

    commands
}
