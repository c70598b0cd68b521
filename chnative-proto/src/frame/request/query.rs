//! The `Query` packet: query text, client info and per-query settings.

use std::collections::BTreeMap;
use std::fmt::{self, Display};

use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::SerializableRequest;
use crate::frame::revision::{self, TCP_PROTOCOL_VERSION};
use crate::frame::{
    ClientPacket, PacketWriter, CLIENT_NAME, CLIENT_VERSION_MAJOR, CLIENT_VERSION_MINOR,
    INTERFACE_TCP, QUERY_KIND_INITIAL, STAGE_COMPLETE,
};

/// Value of a server setting sent with a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl SettingValue {
    /// Parses a textual value as a bool, then an integer, falling back to a string.
    pub fn parse(raw: &str) -> SettingValue {
        if let Ok(b) = raw.parse::<bool>() {
            return SettingValue::Bool(b);
        }
        if let Ok(i) = raw.parse::<i64>() {
            return SettingValue::Int(i);
        }
        SettingValue::String(raw.to_owned())
    }
}

impl Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingValue::Bool(b) => f.write_str(if *b { "1" } else { "0" }),
            SettingValue::Int(i) => write!(f, "{i}"),
            SettingValue::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for SettingValue {
    fn from(v: bool) -> Self {
        SettingValue::Bool(v)
    }
}

impl From<i64> for SettingValue {
    fn from(v: i64) -> Self {
        SettingValue::Int(v)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        SettingValue::String(v.to_owned())
    }
}

impl From<String> for SettingValue {
    fn from(v: String) -> Self {
        SettingValue::String(v)
    }
}

/// Settings sent with every query, keyed by name.
pub type Settings = BTreeMap<String, SettingValue>;

/// Settings marked important make the server fail on unknown names instead of
/// ignoring them.
const SETTING_FLAG_IMPORTANT: u64 = 0x01;

fn write_settings(
    w: &mut PacketWriter,
    settings: &Settings,
    revision: u64,
) -> Result<(), RequestSerializationError> {
    for (name, value) in settings {
        w.write_string(name)?;
        if revision > revision::SETTINGS_SERIALIZED_AS_STRINGS {
            w.write_uvarint(SETTING_FLAG_IMPORTANT)?;
            w.write_string(&value.to_string())?;
        } else {
            match value {
                SettingValue::Bool(b) => w.write_bool(*b)?,
                SettingValue::Int(i) => w.write_uvarint(*i as u64)?,
                SettingValue::String(s) => w.write_string(s)?,
            }
        }
    }
    // Empty name terminates the list.
    w.write_string("")?;
    Ok(())
}

/// Who is sending the query, as reported in `system.query_log`.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub os_user: String,
    pub hostname: String,
    /// Address reported as the initial address of the query.
    pub address: String,
}

impl ClientInfo {
    /// Client info of the local process.
    pub fn local() -> Self {
        let os_user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();
        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned());
        ClientInfo {
            os_user,
            hostname,
            address: "[::ffff:127.0.0.1]:0".to_owned(),
        }
    }

    fn serialize(&self, w: &mut PacketWriter, rev: u64) -> Result<(), RequestSerializationError> {
        w.write_u8(QUERY_KIND_INITIAL)?;
        // initial user and initial query id
        w.write_string("")?;
        w.write_string("")?;
        w.write_string(&self.address)?;
        if rev >= revision::INITIAL_QUERY_START_TIME {
            w.write_i64(0)?;
        }
        w.write_u8(INTERFACE_TCP)?;
        w.write_string(&self.os_user)?;
        w.write_string(&self.hostname)?;
        w.write_string(CLIENT_NAME)?;
        w.write_uvarint(CLIENT_VERSION_MAJOR)?;
        w.write_uvarint(CLIENT_VERSION_MINOR)?;
        w.write_uvarint(TCP_PROTOCOL_VERSION)?;
        if rev >= revision::QUOTA_KEY_IN_CLIENT_INFO {
            w.write_string("")?;
        }
        if rev >= revision::DISTRIBUTED_DEPTH {
            w.write_uvarint(0)?;
        }
        if rev >= revision::VERSION_PATCH {
            w.write_uvarint(0)?;
        }
        if rev >= revision::OPENTELEMETRY {
            // no trace context
            w.write_u8(0)?;
        }
        if rev >= revision::PARALLEL_REPLICAS {
            // collaborate_with_initiator, count_participating_replicas, number_of_current_replica
            w.write_uvarint(0)?;
            w.write_uvarint(0)?;
            w.write_uvarint(0)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Query<'a> {
    pub query_id: &'a str,
    pub sql: &'a str,
    pub client_info: &'a ClientInfo,
    pub settings: &'a Settings,
    /// Whether data packets of this query are block compressed.
    pub compression: bool,
}

impl SerializableRequest for Query<'_> {
    const PACKET: ClientPacket = ClientPacket::Query;

    fn serialize(&self, w: &mut PacketWriter, rev: u64) -> Result<(), RequestSerializationError> {
        w.write_string(self.query_id)?;
        if rev >= revision::CLIENT_INFO {
            self.client_info.serialize(w, rev)?;
        }
        write_settings(w, self.settings, rev)?;
        if rev >= revision::INTERSERVER_SECRET {
            w.write_string("")?;
        }
        w.write_uvarint(STAGE_COMPLETE)?;
        w.write_bool(self.compression)?;
        w.write_string(self.sql)?;
        Ok(())
    }
}
