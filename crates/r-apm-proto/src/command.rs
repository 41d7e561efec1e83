//! ---
//! apm_section: "05-networking-external-interfaces"
//! apm_subsection: "module"
//! apm_type: "source"
//! apm_scope: "code"
//! apm_description: "Wire protocol definitions for the collector uplink."
//! apm_version: "v0.0.0-prealpha"
//! apm_owner: "tbd"
//! ---
use crate::proto::{Command, KeyStringValuePair};

/// Reserved argument key carrying the per-issuance dedup serial.
pub const SERIAL_NUMBER_KEY: &str = "SerialNumber";
/// Reserved argument key carrying the sync cursor to echo next round.
pub const UUID_KEY: &str = "UUID";

/// A collector-issued command decoded into its typed form.
///
/// Every variant exposes a kind string matching the wire `command` field and
/// the serial number used for at-most-once dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCommand {
    ConfigurationDiscovery(ConfigurationDiscoveryCommand),
}

impl AgentCommand {
    pub const CONFIGURATION_DISCOVERY: &'static str = "ConfigurationDiscoveryCommand";

    pub fn kind(&self) -> &'static str {
        match self {
            AgentCommand::ConfigurationDiscovery(_) => Self::CONFIGURATION_DISCOVERY,
        }
    }

    pub fn serial_number(&self) -> &str {
        match self {
            AgentCommand::ConfigurationDiscovery(command) => &command.serial_number,
        }
    }
}

impl TryFrom<&Command> for AgentCommand {
    type Error = CommandDecodeError;

    fn try_from(raw: &Command) -> Result<Self, Self::Error> {
        match raw.command.as_str() {
            Self::CONFIGURATION_DISCOVERY => Ok(AgentCommand::ConfigurationDiscovery(
                ConfigurationDiscoveryCommand::decode(raw)?,
            )),
            other => Err(CommandDecodeError::Unsupported {
                kind: other.to_owned(),
            }),
        }
    }
}

/// Dynamic configuration snapshot pushed back by the collector.
///
/// The wire form flattens everything into `args`: the reserved
/// [`SERIAL_NUMBER_KEY`] and [`UUID_KEY`] entries are lifted out here and the
/// remaining pairs are the configuration payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigurationDiscoveryCommand {
    pub serial_number: String,
    /// Version token of this snapshot; unchanged configuration may echo the
    /// previous value.
    pub uuid: Option<String>,
    pub config: Vec<KeyStringValuePair>,
}

impl ConfigurationDiscoveryCommand {
    fn decode(raw: &Command) -> Result<Self, CommandDecodeError> {
        let mut serial_number = None;
        let mut uuid = None;
        let mut config = Vec::new();

        for pair in &raw.args {
            match pair.key.as_str() {
                SERIAL_NUMBER_KEY => serial_number = Some(pair.value.clone()),
                UUID_KEY => uuid = Some(pair.value.clone()),
                _ => config.push(pair.clone()),
            }
        }

        let serial_number = serial_number.ok_or_else(|| CommandDecodeError::MissingSerial {
            kind: raw.command.clone(),
        })?;

        Ok(Self {
            serial_number,
            uuid,
            config,
        })
    }
}

impl From<ConfigurationDiscoveryCommand> for Command {
    fn from(command: ConfigurationDiscoveryCommand) -> Self {
        let mut args = Vec::with_capacity(command.config.len() + 2);
        args.push(KeyStringValuePair {
            key: SERIAL_NUMBER_KEY.to_owned(),
            value: command.serial_number,
        });
        if let Some(uuid) = command.uuid {
            args.push(KeyStringValuePair {
                key: UUID_KEY.to_owned(),
                value: uuid,
            });
        }
        args.extend(command.config);
        Command {
            command: AgentCommand::CONFIGURATION_DISCOVERY.to_owned(),
            args,
        }
    }
}

/// Why a wire command could not be lifted into [`AgentCommand`].
#[derive(Debug, thiserror::Error)]
pub enum CommandDecodeError {
    #[error("unsupported command kind {kind:?}")]
    Unsupported { kind: String },
    #[error("command {kind:?} carries no serial number")]
    MissingSerial { kind: String },
}
