pub mod domain {
    use std::fmt;
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};

    use crate::error::MalformedRecord;

    /// Transport classification of a packet. TCP wins over UDP when a record
    /// somehow carries both headers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Protocol {
        Tcp,
        Udp,
        #[serde(other)]
        Other,
    }

    impl Protocol {
        pub fn classify(has_tcp: bool, has_udp: bool) -> Self {
            if has_tcp {
                Protocol::Tcp
            } else if has_udp {
                Protocol::Udp
            } else {
                Protocol::Other
            }
        }

        /// Unknown tags map to `Other` instead of failing.
        pub fn from_tag(tag: &str) -> Self {
            match tag.trim().to_ascii_uppercase().as_str() {
                "TCP" => Protocol::Tcp,
                "UDP" => Protocol::Udp,
                _ => Protocol::Other,
            }
        }

        pub fn as_str(&self) -> &'static str {
            match self {
                Protocol::Tcp => "TCP",
                Protocol::Udp => "UDP",
                Protocol::Other => "OTHER",
            }
        }
    }

    impl fmt::Display for Protocol {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct HostId(pub u64);

    impl fmt::Display for HostId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    /// Canonical, decoder-neutral packet event.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PacketRecord {
        #[serde(rename = "timestampSeconds")]
        pub timestamp: f64,
        pub source_addr: String,
        pub dest_addr: String,
        pub protocol: Protocol,
        #[serde(rename = "lengthBytes")]
        pub length: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub source_port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub dest_port: Option<u16>,
        /// Application-layer detail, when the decoder saw any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub info: Option<PacketInfo>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PacketInfo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub tcp_flags: Option<TcpFlags>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub dns_info: Option<DnsInfo>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub http_info: Option<HttpInfo>,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TcpFlags {
        pub syn: bool,
        pub ack: bool,
        pub fin: bool,
        pub rst: bool,
        pub psh: bool,
        pub urg: bool,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct DnsInfo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub query_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub query_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub response_code: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub answers: Vec<DnsAnswer>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DnsAnswer {
        pub name: String,
        #[serde(rename = "type")]
        pub record_type: String,
        pub data: String,
    }

    /// Request fields or response fields, whichever the packet carries.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HttpInfo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub method: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub uri: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub version: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub host: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub user_agent: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub status_code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub status_phrase: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub content_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub content_length: Option<String>,
    }

    impl PacketRecord {
        pub fn new(
            timestamp: f64,
            source_addr: impl Into<String>,
            dest_addr: impl Into<String>,
            protocol: Protocol,
            length: u64,
        ) -> Self {
            Self {
                timestamp,
                source_addr: source_addr.into(),
                dest_addr: dest_addr.into(),
                protocol,
                length,
                source_port: None,
                dest_port: None,
                info: None,
            }
        }

        pub fn with_ports(mut self, source_port: u16, dest_port: u16) -> Self {
            self.source_port = Some(source_port);
            self.dest_port = Some(dest_port);
            self
        }

        pub fn validate(&self) -> Result<(), MalformedRecord> {
            if self.source_addr.trim().is_empty() {
                return Err(MalformedRecord::missing("sourceAddr"));
            }
            if self.dest_addr.trim().is_empty() {
                return Err(MalformedRecord::missing("destAddr"));
            }
            if !self.timestamp.is_finite() {
                return Err(MalformedRecord::invalid(
                    "timestampSeconds",
                    format!("{} is not a finite number", self.timestamp),
                ));
            }
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Host {
        pub id: HostId,
        pub address: Arc<str>,
        pub packet_count: u64,
        pub byte_count: u64,
    }

    /// Directional, protocol specific flow identity.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FlowKey {
        pub source: HostId,
        pub dest: HostId,
        pub protocol: Protocol,
    }

    impl FlowKey {
        pub fn new(source: HostId, dest: HostId, protocol: Protocol) -> Self {
            Self { source, dest, protocol }
        }

        pub fn reversed(&self) -> Self {
            Self {
                source: self.dest,
                dest: self.source,
                protocol: self.protocol,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Flow {
        pub source_host_id: HostId,
        pub dest_host_id: HostId,
        pub protocol: Protocol,
        pub packet_count: u64,
        pub byte_count: u64,
        pub last_timestamp_ms: f64,
    }

    impl Flow {
        pub fn key(&self) -> FlowKey {
            FlowKey::new(self.source_host_id, self.dest_host_id, self.protocol)
        }

        /// Last update in seconds, as carried by the record.
        pub fn last_timestamp(&self) -> f64 {
            self.last_timestamp_ms / 1000.0
        }
    }
}

pub mod dto {
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};

    use super::domain::{Flow, Host, HostId, PacketInfo, PacketRecord, Protocol};
    use crate::error::SourceError;

    /// Immutable point-in-time view of the graph. `version` orders snapshots
    /// of one pipeline and is not part of the wire shape.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct GraphSnapshot {
        #[serde(skip)]
        pub version: u64,
        pub hosts: Vec<Host>,
        pub flows: Vec<Flow>,
    }

    impl GraphSnapshot {
        pub fn is_empty(&self) -> bool {
            self.hosts.is_empty() && self.flows.is_empty()
        }

        pub fn host(&self, id: HostId) -> Option<&Host> {
            self.hosts.iter().find(|host| host.id == id)
        }

        pub fn host_by_address(&self, address: &str) -> Option<&Host> {
            self.hosts.iter().find(|host| &*host.address == address)
        }

        /// True when every flow endpoint names a host present in the snapshot.
        pub fn is_consistent(&self) -> bool {
            self.flows.iter().all(|flow| {
                self.host(flow.source_host_id).is_some() && self.host(flow.dest_host_id).is_some()
            })
        }
    }

    /// One retained packet of a flow, served on detail requests.
    #[derive(Debug, Clone, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct DetailedPacket {
        pub id: u64,
        pub timestamp: f64,
        #[serde(rename = "sourceIP")]
        pub source_ip: String,
        #[serde(rename = "destinationIP")]
        pub destination_ip: String,
        pub protocol: Protocol,
        pub length: u64,
        pub source_port: Option<u16>,
        pub destination_port: Option<u16>,
        #[serde(flatten)]
        pub info: PacketInfo,
    }

    impl DetailedPacket {
        pub fn from_record(id: u64, record: &PacketRecord) -> Self {
            Self {
                id,
                timestamp: record.timestamp * 1000.0,
                source_ip: record.source_addr.clone(),
                destination_ip: record.dest_addr.clone(),
                protocol: record.protocol,
                length: record.length,
                source_port: record.source_port,
                destination_port: record.dest_port,
                info: record.info.clone().unwrap_or_default(),
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub enum CaptureState {
        Started,
        Paused,
        Resumed,
        Stopped,
        Ended,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum ErrorKind {
        PermissionDenied,
        SourceUnavailable,
        MalformedRecord,
        InvalidRequest,
        Internal,
    }

    /// Out-of-band status of a traffic source, fanned out next to snapshots.
    #[derive(Debug, Clone, PartialEq)]
    pub enum StatusEvent {
        Capture { state: CaptureState, message: String },
        Error { kind: ErrorKind, message: String },
    }

    impl StatusEvent {
        pub fn capture(state: CaptureState, message: impl Into<String>) -> Self {
            StatusEvent::Capture {
                state,
                message: message.into(),
            }
        }
    }

    impl From<&SourceError> for StatusEvent {
        fn from(err: &SourceError) -> Self {
            StatusEvent::Error {
                kind: err.kind(),
                message: err.remediation(),
            }
        }
    }

    /// Viewer -> server control messages.
    #[derive(Debug, Clone, PartialEq, Deserialize)]
    #[serde(tag = "type", rename_all = "camelCase")]
    pub enum ClientMessage {
        StartCapture {
            #[serde(default)]
            interface: Option<String>,
        },
        StopTestTraffic,
        RequestPacketDetails {
            #[serde(rename = "sourceId")]
            source_id: HostId,
            #[serde(rename = "targetId")]
            target_id: HostId,
            protocol: Protocol,
        },
    }

    /// Server -> viewer messages.
    #[derive(Debug, Clone, Serialize)]
    #[serde(tag = "type", rename_all = "camelCase")]
    pub enum ServerMessage {
        NetworkUpdate { data: Arc<GraphSnapshot> },
        CaptureStatus { status: CaptureState, message: String },
        Error { kind: ErrorKind, message: String },
        PacketDetails { packets: Vec<DetailedPacket> },
    }

    impl ServerMessage {
        pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
            ServerMessage::Error {
                kind,
                message: message.into(),
            }
        }
    }

    impl From<StatusEvent> for ServerMessage {
        fn from(event: StatusEvent) -> Self {
            match event {
                StatusEvent::Capture { state, message } => ServerMessage::CaptureStatus {
                    status: state,
                    message,
                },
                StatusEvent::Error { kind, message } => ServerMessage::Error { kind, message },
            }
        }
    }

    impl From<&SourceError> for ServerMessage {
        fn from(err: &SourceError) -> Self {
            StatusEvent::from(err).into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::domain::*;
    use super::dto::*;
    use serde_json::json;

    #[test]
    fn protocol_classification_prefers_tcp() {
        assert_eq!(Protocol::classify(true, true), Protocol::Tcp);
        assert_eq!(Protocol::classify(false, true), Protocol::Udp);
        assert_eq!(Protocol::classify(false, false), Protocol::Other);
    }

    #[test]
    fn unknown_protocol_tag_is_other() {
        assert_eq!(Protocol::from_tag("tcp"), Protocol::Tcp);
        assert_eq!(Protocol::from_tag("SCTP"), Protocol::Other);
        let parsed: Protocol = serde_json::from_value(json!("ICMP")).unwrap();
        assert_eq!(parsed, Protocol::Other);
    }

    #[test]
    fn snapshot_serializes_to_viewer_shape() {
        let snapshot = GraphSnapshot {
            version: 9,
            hosts: vec![Host {
                id: HostId(1),
                address: "10.0.0.1".into(),
                packet_count: 2,
                byte_count: 150,
            }],
            flows: vec![Flow {
                source_host_id: HostId(1),
                dest_host_id: HostId(1),
                protocol: Protocol::Udp,
                packet_count: 1,
                byte_count: 150,
                last_timestamp_ms: 2000.0,
            }],
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(
            value,
            json!({
                "hosts": [{"id": 1, "address": "10.0.0.1", "packetCount": 2, "byteCount": 150}],
                "flows": [{
                    "sourceHostId": 1, "destHostId": 1, "protocol": "UDP",
                    "packetCount": 1, "byteCount": 150, "lastTimestampMs": 2000.0
                }]
            })
        );
    }

    #[test]
    fn control_messages_parse() {
        let start: ClientMessage =
            serde_json::from_str(r#"{"type":"startCapture","interface":"test"}"#).unwrap();
        assert_eq!(
            start,
            ClientMessage::StartCapture {
                interface: Some("test".into())
            }
        );

        let details: ClientMessage = serde_json::from_str(
            r#"{"type":"requestPacketDetails","sourceId":1,"targetId":2,"protocol":"TCP"}"#,
        )
        .unwrap();
        assert_eq!(
            details,
            ClientMessage::RequestPacketDetails {
                source_id: HostId(1),
                target_id: HostId(2),
                protocol: Protocol::Tcp
            }
        );
    }

    #[test]
    fn packet_detail_flattens_optional_inspection() {
        let mut record = PacketRecord::new(1.5, "10.0.0.1", "10.0.0.2", Protocol::Tcp, 60).with_ports(40000, 80);
        let plain = serde_json::to_value(DetailedPacket::from_record(1, &record)).unwrap();
        assert!(plain.get("tcpFlags").is_none());
        assert_eq!(plain["timestamp"], 1500.0);

        record.info = Some(PacketInfo {
            tcp_flags: Some(TcpFlags {
                syn: true,
                ..TcpFlags::default()
            }),
            ..PacketInfo::default()
        });
        let value = serde_json::to_value(DetailedPacket::from_record(2, &record)).unwrap();
        assert_eq!(value["tcpFlags"]["syn"], true);
        assert_eq!(value["destinationPort"], 80);
        assert!(value.get("dnsInfo").is_none());
    }

    #[test]
    fn record_without_destination_is_malformed() {
        let record = PacketRecord::new(1.0, "10.0.0.1", "", Protocol::Tcp, 60);
        let err = record.validate().unwrap_err();
        assert_eq!(err.field, "destAddr");
    }
}
