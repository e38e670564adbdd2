//! Gcode-style command surface.
//!
//! Lines look like `OAMS_LOAD_SPOOL FPS=fps0 GROUP=T0`: a command name
//! followed by KEY=VALUE parameters. The host registers these names and
//! forwards the raw line; parsing and dispatch live here so every surface
//! (gcode, CLI, tests) shares one behavior.

use std::collections::BTreeMap;

use oams_traits::FollowerDirection;

use crate::coordinator::{Coordinator, Ticket};
use crate::error::AmsError;

/// A parsed `NAME KEY=VALUE ...` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcodeCommand {
    pub name: String,
    pub params: BTreeMap<String, String>,
}

impl GcodeCommand {
    pub fn parse(line: &str) -> Result<Self, AmsError> {
        let mut parts = line.split_whitespace();
        let name = parts
            .next()
            .ok_or_else(|| AmsError::Command("empty command line".into()))?
            .to_ascii_uppercase();
        let mut params = BTreeMap::new();
        for part in parts {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| AmsError::Command(format!("malformed parameter '{part}'")))?;
            params.insert(key.to_ascii_uppercase(), value.to_string());
        }
        Ok(Self { name, params })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    fn require(&self, key: &str) -> Result<&str, AmsError> {
        self.get(key)
            .ok_or_else(|| AmsError::Command(format!("{} requires {key}", self.name)))
    }

    fn require_u8(&self, key: &str) -> Result<u8, AmsError> {
        self.require(key)?
            .parse()
            .map_err(|_| AmsError::Command(format!("{key} must be a small integer")))
    }
}

/// Outcome of dispatching one command line.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    /// Finished synchronously with an operator message.
    Done(String),
    /// Accepted; resolves through subsequent ticks.
    InFlight(Ticket),
}

impl Coordinator {
    /// Parse and dispatch one gcode-style command line.
    pub fn run_command(&mut self, line: &str) -> Result<CommandReply, AmsError> {
        let cmd = GcodeCommand::parse(line)?;
        match cmd.name.as_str() {
            "OAMS_LOAD_SPOOL" => {
                let fps = cmd.require("FPS")?;
                let group = cmd.get("GROUP").or_else(|| cmd.get("LANE"));
                let ticket = self.load_spool(fps, group)?;
                Ok(CommandReply::InFlight(ticket))
            }
            "OAMS_UNLOAD_SPOOL" => {
                let fps = cmd.require("FPS")?;
                let ticket = self.unload_spool(fps)?;
                Ok(CommandReply::InFlight(ticket))
            }
            "OAMS_FOLLOWER" => {
                let fps = cmd.require("FPS")?;
                let enable = cmd.require_u8("ENABLE")? != 0;
                let direction = FollowerDirection::from_wire(cmd.require_u8("DIRECTION")?);
                self.set_follower(fps, enable, direction)?;
                Ok(CommandReply::Done("OK".into()))
            }
            "SET_RUNOUT" => {
                let lane = cmd.require("LANE")?;
                let runout = cmd.require("RUNOUT")?;
                self.set_runout(lane, runout)?;
                Ok(CommandReply::Done("OK".into()))
            }
            "OAMS_CALIBRATE_HUB_HES" => {
                let feeder = cmd.require("FEEDER")?;
                let bay = cmd.require_u8("SPOOL")?;
                self.calibrate_hub(feeder, bay)?;
                Ok(CommandReply::Done("OK".into()))
            }
            "OAMS_CALIBRATE_PTFE" => {
                let feeder = cmd.require("FEEDER")?;
                let bay = cmd.require_u8("SPOOL")?;
                self.calibrate_ptfe(feeder, bay)?;
                Ok(CommandReply::Done("OK".into()))
            }
            "OAMS_CURRENT_LOADED_GROUP" => Ok(CommandReply::Done(
                self.current_loaded_group()
                    .map_or_else(|| "no group is currently loaded".into(), String::from),
            )),
            "OAMS_CLEAR_ERRORS" => {
                self.clear_errors()?;
                Ok(CommandReply::Done("OK".into()))
            }
            other => Err(AmsError::Command(format!("unknown command '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_params() {
        let cmd = GcodeCommand::parse("OAMS_LOAD_SPOOL FPS=fps0 GROUP=T0").expect("parse");
        assert_eq!(cmd.name, "OAMS_LOAD_SPOOL");
        assert_eq!(cmd.get("FPS"), Some("fps0"));
        assert_eq!(cmd.get("GROUP"), Some("T0"));
        assert_eq!(cmd.get("LANE"), None);
    }

    #[test]
    fn keys_are_case_insensitive_values_are_not() {
        let cmd = GcodeCommand::parse("oams_follower fps=Fps0 enable=1").expect("parse");
        assert_eq!(cmd.name, "OAMS_FOLLOWER");
        assert_eq!(cmd.get("FPS"), Some("Fps0"));
    }

    #[test]
    fn rejects_malformed_parameters() {
        assert!(GcodeCommand::parse("OAMS_LOAD_SPOOL FPS").is_err());
        assert!(GcodeCommand::parse("").is_err());
        assert!(GcodeCommand::parse("   ").is_err());
    }
}
