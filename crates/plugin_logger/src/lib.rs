//! Example plugin that prints every server event as a JSON line.
//!
//! Build it as a shared library and list `plugin_logger` under
//! `plugins.auto_load` to have the server pick it up at startup.

use async_trait::async_trait;
use battle_events::{
    current_timestamp, export_plugin, EventVerdict, Plugin, PluginError, ServerEvent,
};
use serde::Serialize;
use std::collections::BTreeMap;

/// One printed log line.
#[derive(Debug, Serialize)]
struct LogLine<'a> {
    timestamp: u64,
    sequence: u64,
    #[serde(flatten)]
    event: &'a ServerEvent,
}

/// Prints events and keeps a per-kind tally for the summary printed on unload.
pub struct LoggerPlugin {
    name: String,
    events_logged: u64,
    tally: BTreeMap<&'static str, u64>,
    started_at: u64,
}

impl Default for LoggerPlugin {
    fn default() -> Self {
        println!("📝 LoggerPlugin: Creating new instance");
        Self {
            name: "logger".to_string(),
            events_logged: 0,
            tally: BTreeMap::new(),
            started_at: current_timestamp(),
        }
    }
}

impl LoggerPlugin {
    fn render(&self, event: &ServerEvent) -> Result<String, PluginError> {
        let line = LogLine {
            timestamp: current_timestamp(),
            sequence: self.events_logged,
            event,
        };
        serde_json::to_string(&line).map_err(|e| PluginError::ExecutionError(e.to_string()))
    }

    pub fn events_logged(&self) -> u64 {
        self.events_logged
    }
}

#[async_trait]
impl Plugin for LoggerPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn on_load(&mut self) -> Result<(), PluginError> {
        println!("📝 LoggerPlugin: Logging every server event");
        Ok(())
    }

    async fn on_event(&mut self, event: &ServerEvent) -> Result<EventVerdict, PluginError> {
        let line = self.render(event)?;
        println!("📝 {line}");

        self.events_logged += 1;
        *self.tally.entry(event.kind()).or_default() += 1;
        Ok(EventVerdict::Continue)
    }

    async fn on_unload(&mut self) -> Result<(), PluginError> {
        let uptime = current_timestamp().saturating_sub(self.started_at);
        println!(
            "📝 LoggerPlugin: Shutting down after {}s, {} events logged",
            uptime, self.events_logged
        );
        for (kind, count) in &self.tally {
            println!("📝   {kind}: {count}");
        }
        Ok(())
    }
}

export_plugin!(LoggerPlugin);

#[cfg(test)]
mod tests {
    use super::*;
    use battle_events::{BattleId, BattleOutcome, BattleResult, ConnectionId, DisconnectReason};

    #[tokio::test]
    async fn logs_events_without_vetoing() {
        let mut plugin = LoggerPlugin::default();
        let events = [
            ServerEvent::NewConnection {
                id: ConnectionId(0),
                remote_addr: "127.0.0.1:4000".parse().unwrap(),
            },
            ServerEvent::BattleEnded {
                battle_id: BattleId::from("b1"),
                result: BattleResult::Completed(BattleOutcome::Tie),
            },
            ServerEvent::ConnectionClosed {
                id: ConnectionId(0),
                reason: DisconnectReason::ClientClosed,
            },
        ];

        for event in &events {
            assert_eq!(plugin.on_event(event).await.unwrap(), EventVerdict::Continue);
        }
        assert_eq!(plugin.events_logged(), 3);
        assert_eq!(plugin.tally.values().sum::<u64>(), 3);
        plugin.on_unload().await.unwrap();
    }

    #[test]
    fn log_line_carries_the_event_tag() {
        let plugin = LoggerPlugin::default();
        let line = plugin
            .render(&ServerEvent::BackingStoreChanged {
                previous: "sqlite".to_string(),
                current: "postgresql".to_string(),
            })
            .unwrap();

        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["event"], "backing_store_changed");
        assert_eq!(value["current"], "postgresql");
        assert_eq!(value["sequence"], 0);
    }
}
