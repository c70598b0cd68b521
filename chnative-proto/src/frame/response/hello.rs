use crate::frame::frame_errors::ParseError;
use crate::frame::revision::{self, TCP_PROTOCOL_VERSION};
use crate::frame::PacketReader;

/// Server identity from its hello packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerHello {
    pub name: String,
    pub version_major: u64,
    pub version_minor: u64,
    pub version_patch: u64,
    /// Revision the server speaks.
    pub revision: u64,
    /// Server default timezone, if the server is new enough to send it.
    pub timezone: Option<String>,
    pub display_name: Option<String>,
}

impl ServerHello {
    pub async fn deserialize(r: &mut PacketReader) -> Result<Self, ParseError> {
        let mut hello = ServerHello {
            name: r.read_string().await?,
            version_major: r.read_uvarint().await?,
            version_minor: r.read_uvarint().await?,
            revision: r.read_uvarint().await?,
            ..Default::default()
        };
        if hello.revision >= revision::SERVER_TIMEZONE {
            hello.timezone = Some(r.read_string().await?);
        }
        if hello.revision >= revision::SERVER_DISPLAY_NAME {
            hello.display_name = Some(r.read_string().await?);
        }
        if hello.revision >= revision::VERSION_PATCH {
            hello.version_patch = r.read_uvarint().await?;
        } else {
            hello.version_patch = hello.revision;
        }
        Ok(hello)
    }

    /// Revision both sides understand; gates every later packet of the connection.
    pub fn negotiated_revision(&self) -> u64 {
        self.revision.min(TCP_PROTOCOL_VERSION)
    }

    pub fn version(&self) -> String {
        format!(
            "{}.{}.{}",
            self.version_major, self.version_minor, self.version_patch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Compression, PacketWriter};

    async fn decode(wire: Vec<u8>) -> ServerHello {
        let mut r = PacketReader::new(std::io::Cursor::new(wire));
        ServerHello::deserialize(&mut r).await.unwrap()
    }

    #[tokio::test]
    async fn fields_gated_by_server_revision() {
        let mut w = PacketWriter::new(Compression::None);
        w.write_string("ClickHouse").unwrap();
        w.write_uvarint(24).unwrap();
        w.write_uvarint(3).unwrap();
        w.write_uvarint(54470).unwrap();
        w.write_string("UTC").unwrap();
        w.write_string("node-1").unwrap();
        w.write_uvarint(7).unwrap();
        let hello = decode(w.take()).await;
        assert_eq!(hello.timezone.as_deref(), Some("UTC"));
        assert_eq!(hello.display_name.as_deref(), Some("node-1"));
        assert_eq!(hello.version(), "24.3.7");
        assert_eq!(hello.negotiated_revision(), TCP_PROTOCOL_VERSION);

        let mut w = PacketWriter::new(Compression::None);
        w.write_string("old").unwrap();
        w.write_uvarint(1).unwrap();
        w.write_uvarint(1).unwrap();
        w.write_uvarint(54060).unwrap();
        w.write_string("Europe/Moscow").unwrap();
        let hello = decode(w.take()).await;
        assert_eq!(hello.timezone.as_deref(), Some("Europe/Moscow"));
        assert_eq!(hello.display_name, None);
        assert_eq!(hello.negotiated_revision(), 54060);
    }
}
