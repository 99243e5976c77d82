//! Mission documents and the per-agent `MissionInit` envelope sent to the simulator.

use tracing::warn;

use crate::error::{ControlError, Result};
use crate::protocol::MALMO_VERSION;

const MALMO_NAMESPACE: &str = "http://ProjectMalmo.microsoft.com";
const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";
const CLIENT_PORT: u16 = 0;

/// Endpoint of the primary agent's integrated server, joined by every other agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    pub address: String,
    pub port: u16,
}

/// Opens the primary agent's world to human players.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumanInteraction {
    pub port: u16,
    pub max_players: u32,
}

/// A `<Mission>` element, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissionDocument {
    mission: String,
}

impl MissionDocument {
    /// Keep the `<Mission>` element of `xml`, dropping any XML declaration or leading text.
    pub fn new(xml: &str) -> Result<MissionDocument> {
        let start = find_element(xml, "Mission", 0)
            .ok_or_else(|| ControlError::InvalidMission("no <Mission> element".to_string()))?;
        Ok(MissionDocument {
            mission: xml[start..].trim_end().to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.mission
    }

    /// The `MissionInit` document for agent `role` of experiment `experiment_uid`.
    ///
    /// Non-primary agents carry the `server` they must join; the primary agent may open its
    /// world to humans through `interaction`.
    pub fn mission_init(
        &self,
        role: usize,
        experiment_uid: &str,
        server: Option<&ServerEndpoint>,
        interaction: Option<HumanInteraction>,
    ) -> String {
        let mission = match interaction {
            Some(interaction) if role == 0 => with_human_interaction(&self.mission, interaction),
            _ => self.mission.clone(),
        };
        let server = server
            .map(|endpoint| {
                format!(
                    "<MinecraftServerConnection address=\"{}\" port=\"{}\"/>",
                    escape(&endpoint.address),
                    endpoint.port
                )
            })
            .unwrap_or_default();

        format!(
            "<MissionInit xmlns=\"{MALMO_NAMESPACE}\" xmlns:xsi=\"{XSI_NAMESPACE}\" \
             SchemaVersion=\"\" PlatformVersion=\"{MALMO_VERSION}\">\
             {mission}\
             <ExperimentUID>{uid}</ExperimentUID>\
             {server}\
             <ClientRole>{role}</ClientRole>\
             <ClientAgentConnection>\
             <ClientIPAddress>127.0.0.1</ClientIPAddress>\
             <ClientMissionControlPort>{CLIENT_PORT}</ClientMissionControlPort>\
             <ClientCommandsPort>{CLIENT_PORT}</ClientCommandsPort>\
             <AgentIPAddress>127.0.0.1</AgentIPAddress>\
             <AgentMissionControlPort>{CLIENT_PORT}</AgentMissionControlPort>\
             <AgentVideoPort>{CLIENT_PORT}</AgentVideoPort>\
             <AgentDepthPort>{CLIENT_PORT}</AgentDepthPort>\
             <AgentLuminancePort>{CLIENT_PORT}</AgentLuminancePort>\
             <AgentObservationsPort>{CLIENT_PORT}</AgentObservationsPort>\
             <AgentRewardsPort>{CLIENT_PORT}</AgentRewardsPort>\
             <AgentColourMapPort>{CLIENT_PORT}</AgentColourMapPort>\
             </ClientAgentConnection>\
             </MissionInit>",
            uid = escape(experiment_uid),
        )
    }
}

/// Byte offset of the first `<name` start tag (optionally namespace-prefixed) at or after `from`.
fn find_element(xml: &str, name: &str, from: usize) -> Option<usize> {
    let mut search = from;
    while let Some(offset) = xml[search..].find('<') {
        let start = search + offset;
        let tag = &xml[start + 1..];
        let local = tag
            .split(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .next()
            .unwrap_or_default();
        let local = local.rsplit(':').next().unwrap_or(local);
        if local == name {
            return Some(start);
        }
        search = start + 1;
    }
    None
}

fn with_human_interaction(mission: &str, interaction: HumanInteraction) -> String {
    let element = format!(
        "<HumanInteraction><Port>{}</Port><MaxPlayers>{}</MaxPlayers></HumanInteraction>",
        interaction.port, interaction.max_players
    );
    let Some(start) = find_element(mission, "ServerSection", 0) else {
        warn!("mission has no ServerSection, human interaction not enabled");
        return mission.to_string();
    };
    let Some(end) = mission[start..].find('>').map(|i| start + i) else {
        return mission.to_string();
    };

    let mut out = String::with_capacity(mission.len() + element.len() + 16);
    if mission[..end].ends_with('/') {
        // <ServerSection/>: expand into an element holding only the interaction
        let open = &mission[start..end - 1];
        let name = open.trim_start_matches('<').split_whitespace().next().unwrap_or("ServerSection");
        out.push_str(&mission[..end - 1]);
        out.push('>');
        out.push_str(&element);
        out.push_str(&format!("</{name}>"));
    } else {
        out.push_str(&mission[..=end]);
        out.push_str(&element);
    }
    out.push_str(&mission[end + 1..]);
    out
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const MISSION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Mission xmlns="http://ProjectMalmo.microsoft.com"><About><Summary>test</Summary></About><ServerSection><ServerHandlers/></ServerSection><AgentSection mode="Survival"><Name>agent</Name></AgentSection></Mission>
"#;

    #[test]
    fn declaration_is_dropped() {
        let doc = MissionDocument::new(MISSION).unwrap();
        assert!(doc.as_str().starts_with("<Mission "));
        assert!(doc.as_str().ends_with("</Mission>"));
        assert!(MissionDocument::new("<About/>").is_err());
    }

    #[test]
    fn primary_agent_envelope() {
        let doc = MissionDocument::new(MISSION).unwrap();
        let xml = doc.mission_init(0, "uid-1", None, None);
        assert!(xml.starts_with("<MissionInit "));
        assert!(xml.contains("PlatformVersion=\"0.37.0\""));
        assert!(xml.contains("<ExperimentUID>uid-1</ExperimentUID><ClientRole>0</ClientRole>"));
        assert!(!xml.contains("MinecraftServerConnection"));
        assert!(!xml.contains("HumanInteraction"));
    }

    #[test]
    fn secondary_agent_joins_primary_server() {
        let doc = MissionDocument::new(MISSION).unwrap();
        let server = ServerEndpoint {
            address: "127.0.0.1".to_string(),
            port: 25565,
        };
        let xml = doc.mission_init(1, "uid-1", Some(&server), None);
        assert!(xml.contains(
            "<ExperimentUID>uid-1</ExperimentUID>\
             <MinecraftServerConnection address=\"127.0.0.1\" port=\"25565\"/>\
             <ClientRole>1</ClientRole>"
        ));
    }

    #[test]
    fn interaction_only_for_primary() {
        let doc = MissionDocument::new(MISSION).unwrap();
        let interaction = HumanInteraction {
            port: 31415,
            max_players: 4,
        };
        let xml = doc.mission_init(0, "u", None, Some(interaction));
        assert!(xml.contains(
            "<ServerSection><HumanInteraction><Port>31415</Port><MaxPlayers>4</MaxPlayers>\
             </HumanInteraction><ServerHandlers/>"
        ));
        let xml = doc.mission_init(1, "u", None, Some(interaction));
        assert!(!xml.contains("HumanInteraction"));
    }

    #[test]
    fn empty_server_section_is_expanded() {
        let out = with_human_interaction(
            "<Mission><ServerSection/></Mission>",
            HumanInteraction {
                port: 1,
                max_players: 2,
            },
        );
        assert_eq!(
            out,
            "<Mission><ServerSection><HumanInteraction><Port>1</Port><MaxPlayers>2</MaxPlayers>\
             </HumanInteraction></ServerSection></Mission>"
        );
    }

    #[test]
    fn attribute_values_are_escaped() {
        assert_eq!(escape("a\"<b>&"), "a&quot;&lt;b&gt;&amp;");
    }
}
