//! Logger setup.
//!
//! Renders `log` records, including their structured key-value fields, in
//! either of the two supported formats: `lsmet` (`key=value` text) or `json`
//! (one object per line).

use std::io::Write;

use env_logger::Builder;
use log::kv::{Key, Value, VisitSource};

use crate::config::{Config, LogFormat};
use crate::error::ConductorResult;

struct FieldCollector {
    fields: Vec<(String, String)>,
}

impl<'kvs> VisitSource<'kvs> for FieldCollector {
    fn visit_pair(&mut self, key: Key<'kvs>, value: Value<'kvs>) -> Result<(), log::kv::Error> {
        self.fields.push((key.to_string(), value.to_string()));
        Ok(())
    }
}

/// Initializes the global logger from the configuration.
pub fn init(config: &Config) -> ConductorResult<()> {
    let format = config.log_format()?;
    let mut builder = Builder::new();
    builder.filter_level(config.level_filter());
    builder.format(move |buf, record| {
        let mut collector = FieldCollector { fields: Vec::new() };
        // Field rendering errors must not take the logger down with them.
        let _ = record.key_values().visit(&mut collector);

        let timestamp = buf.timestamp().to_string();
        let level = record.level().as_str().to_ascii_lowercase();
        let msg = record.args().to_string();

        let line = match format {
            LogFormat::Lsmet => render_lsmet(&timestamp, &level, &msg, &collector.fields),
            LogFormat::Json => render_json(&timestamp, &level, &msg, &collector.fields),
        };
        writeln!(buf, "{line}")
    });
    builder.init();
    Ok(())
}

fn render_lsmet(timestamp: &str, level: &str, msg: &str, fields: &[(String, String)]) -> String {
    let mut line = format!("time=\"{timestamp}\" level={level} msg={msg:?}");
    for (key, value) in fields {
        line.push_str(&format!(" {key}={value:?}"));
    }
    line
}

fn render_json(timestamp: &str, level: &str, msg: &str, fields: &[(String, String)]) -> String {
    let mut object = serde_json::Map::new();
    object.insert("time".to_string(), timestamp.into());
    object.insert("level".to_string(), level.into());
    object.insert("msg".to_string(), msg.into());
    for (key, value) in fields {
        object.insert(key.clone(), value.clone().into());
    }
    serde_json::Value::Object(object).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsmet_line() {
        let fields = vec![
            ("service_name".to_string(), "solr".to_string()),
            ("mount_point".to_string(), "/solr".to_string()),
        ];
        let line = render_lsmet("2026-01-01T00:00:00Z", "info", "Starting worker", &fields);
        assert_eq!(
            line,
            "time=\"2026-01-01T00:00:00Z\" level=info msg=\"Starting worker\" \
             service_name=\"solr\" mount_point=\"/solr\""
        );
    }

    #[test]
    fn test_json_line_carries_fields() {
        let fields = vec![("worker_type".to_string(), "consul_health".to_string())];
        let line = render_json("2026-01-01T00:00:00Z", "error", "poll failed", &fields);
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["level"], "error");
        assert_eq!(value["msg"], "poll failed");
        assert_eq!(value["worker_type"], "consul_health");
    }
}
