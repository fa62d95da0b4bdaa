// Decoders from capture-tool output to `PacketRecord`, plus the incremental
// splitter for tshark's streamed JSON array.

use std::borrow::Cow;

use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::error::MalformedRecord;
use crate::models::domain::{DnsAnswer, DnsInfo, HttpInfo, PacketInfo, PacketRecord, Protocol, TcpFlags};

/// Decodes one tshark `-T json` packet object.
pub fn decode_tshark(packet: &Value) -> Result<PacketRecord, MalformedRecord> {
    let layers = packet
        .pointer("/_source/layers")
        .filter(|layers| layers.is_object())
        .ok_or_else(|| MalformedRecord::missing("_source.layers"))?;

    let epoch = layer(layers, "frame")
        .and_then(|frame| scalar(frame, "frame.time_epoch"))
        .ok_or_else(|| MalformedRecord::missing("frame.time_epoch"))?;
    let timestamp = parse_epoch(&epoch)?;

    let (source_addr, dest_addr, length) = if let Some(ip) = layer(layers, "ip") {
        (
            required(ip, "ip.src")?,
            required(ip, "ip.dst")?,
            required(ip, "ip.len")?,
        )
    } else if let Some(ip) = layer(layers, "ipv6") {
        (
            required(ip, "ipv6.src")?,
            required(ip, "ipv6.dst")?,
            required(ip, "ipv6.plen")?,
        )
    } else {
        return Err(MalformedRecord::missing("ip"));
    };
    let length = length
        .trim()
        .parse::<u64>()
        .map_err(|_| MalformedRecord::invalid("ip.len", format!("{length:?} is not a byte count")))?;

    let tcp = layer(layers, "tcp");
    let udp = layer(layers, "udp");
    let protocol = Protocol::classify(tcp.is_some(), udp.is_some());
    let (source_port, dest_port) = match protocol {
        Protocol::Tcp => ports(tcp, "tcp.srcport", "tcp.dstport"),
        Protocol::Udp => ports(udp, "udp.srcport", "udp.dstport"),
        Protocol::Other => (None, None),
    };

    Ok(PacketRecord {
        timestamp,
        source_addr: source_addr.into_owned(),
        dest_addr: dest_addr.into_owned(),
        protocol,
        length,
        source_port,
        dest_port,
        info: inspect(layers, tcp),
    })
}

/// Application-layer detail for the packet store. Absent layers stay `None`.
fn inspect(layers: &Value, tcp: Option<&Value>) -> Option<PacketInfo> {
    let info = PacketInfo {
        tcp_flags: tcp.map(tcp_flags),
        dns_info: layer(layers, "dns").map(dns_info),
        http_info: layer(layers, "http").and_then(http_info),
    };
    (info != PacketInfo::default()).then_some(info)
}

fn tcp_flags(tcp: &Value) -> TcpFlags {
    let set = |field| nested(tcp, field).map_or(false, |value| matches!(value.trim(), "1" | "True" | "true"));
    TcpFlags {
        syn: set("tcp.flags.syn"),
        ack: set("tcp.flags.ack"),
        fin: set("tcp.flags.fin"),
        rst: set("tcp.flags.reset"),
        psh: set("tcp.flags.push"),
        urg: set("tcp.flags.urg"),
    }
}

fn dns_info(dns: &Value) -> DnsInfo {
    let text = |field| nested(dns, field).map(Cow::into_owned);
    // tshark keys each answer by a description; a single answer may be inline
    let answers: Vec<&Value> = match dns.get("Answers") {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::Object(map)) if map.contains_key("dns.resp.name") => vec![&dns["Answers"]],
        Some(Value::Object(map)) => map.values().collect(),
        _ => Vec::new(),
    };
    DnsInfo {
        query_name: text("dns.qry.name"),
        query_type: text("dns.qry.type"),
        response_code: text("dns.flags.rcode"),
        answers: answers.into_iter().filter(|a| a.is_object()).map(dns_answer).collect(),
    }
}

fn dns_answer(answer: &Value) -> DnsAnswer {
    let field = |name| scalar(answer, name).map(Cow::into_owned);
    DnsAnswer {
        name: field("dns.resp.name").unwrap_or_default(),
        record_type: field("dns.resp.type").unwrap_or_default(),
        data: ["dns.a", "dns.aaaa", "dns.cname", "dns.resp.data"]
            .into_iter()
            .find_map(field)
            .unwrap_or_default(),
    }
}

fn http_info(http: &Value) -> Option<HttpInfo> {
    let text = |field| nested(http, field).map(Cow::into_owned);
    let info = HttpInfo {
        method: text("http.request.method"),
        uri: text("http.request.uri"),
        version: text("http.request.version"),
        host: text("http.host"),
        user_agent: text("http.user_agent"),
        status_code: text("http.response.code"),
        status_phrase: text("http.response.phrase"),
        content_type: text("http.content_type"),
        content_length: text("http.content_length_header").or_else(|| text("http.content_length")),
    };
    (info != HttpInfo::default()).then_some(info)
}

// tshark groups related fields under `*_tree` objects and description keys.
fn nested<'a>(value: &'a Value, field: &str) -> Option<Cow<'a, str>> {
    scalar(value, field).or_else(|| match value {
        Value::Object(map) => map
            .values()
            .filter(|child| child.is_object())
            .find_map(|child| nested(child, field)),
        _ => None,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord {
    timestamp_seconds: Option<f64>,
    source_addr: Option<String>,
    dest_addr: Option<String>,
    protocol: Option<String>,
    length_bytes: Option<i64>,
    source_port: Option<u16>,
    dest_port: Option<u16>,
    #[serde(default)]
    info: Option<PacketInfo>,
}

impl TryFrom<WireRecord> for PacketRecord {
    type Error = MalformedRecord;

    fn try_from(wire: WireRecord) -> Result<Self, Self::Error> {
        let length = wire
            .length_bytes
            .ok_or_else(|| MalformedRecord::missing("lengthBytes"))?;
        let length = u64::try_from(length)
            .map_err(|_| MalformedRecord::invalid("lengthBytes", format!("{length} is negative")))?;
        let record = PacketRecord {
            timestamp: wire
                .timestamp_seconds
                .ok_or_else(|| MalformedRecord::missing("timestampSeconds"))?,
            source_addr: wire.source_addr.ok_or_else(|| MalformedRecord::missing("sourceAddr"))?,
            dest_addr: wire.dest_addr.ok_or_else(|| MalformedRecord::missing("destAddr"))?,
            protocol: Protocol::from_tag(
                &wire.protocol.ok_or_else(|| MalformedRecord::missing("protocol"))?,
            ),
            length,
            source_port: wire.source_port,
            dest_port: wire.dest_port,
            info: wire.info,
        };
        record.validate()?;
        Ok(record)
    }
}

/// Decodes one canonical record, the shape replay files are written in.
pub fn decode_canonical(line: &str) -> Result<PacketRecord, MalformedRecord> {
    let wire: WireRecord = serde_json::from_str(line)
        .map_err(|err| MalformedRecord::invalid("record", err.to_string()))?;
    PacketRecord::try_from(wire)
}

// tshark nests a layer as an array when it occurs more than once (tunnels);
// the outermost one wins.
fn layer<'a>(layers: &'a Value, name: &str) -> Option<&'a Value> {
    match layers.get(name)? {
        Value::Null => None,
        Value::Array(items) => items.first().filter(|item| !item.is_null()),
        other => Some(other),
    }
}

fn scalar<'a>(layer: &'a Value, field: &str) -> Option<Cow<'a, str>> {
    match layer.get(field)? {
        Value::String(text) => Some(Cow::Borrowed(text.as_str())),
        Value::Number(number) => Some(Cow::Owned(number.to_string())),
        Value::Array(items) => items.first().and_then(|item| item.as_str()).map(Cow::Borrowed),
        _ => None,
    }
}

fn required<'a>(layer: &'a Value, field: &'static str) -> Result<Cow<'a, str>, MalformedRecord> {
    scalar(layer, field)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| MalformedRecord::missing(field))
}

fn ports(layer: Option<&Value>, source: &str, dest: &str) -> (Option<u16>, Option<u16>) {
    let port = |field| {
        layer
            .and_then(|layer| scalar(layer, field))
            .and_then(|value| value.trim().parse().ok())
    };
    (port(source), port(dest))
}

// Newer tshark builds print `frame.time_epoch` as an RFC 3339 string.
fn parse_epoch(epoch: &str) -> Result<f64, MalformedRecord> {
    let epoch = epoch.trim();
    if let Ok(seconds) = epoch.parse::<f64>() {
        if seconds.is_finite() {
            return Ok(seconds);
        }
    }
    DateTime::parse_from_rfc3339(epoch)
        .map(|time| time.timestamp_micros() as f64 / 1_000_000.0)
        .map_err(|_| MalformedRecord::invalid("frame.time_epoch", format!("{epoch:?} is not a time")))
}

const INDENT: &[char] = &[' ', '\t', '\r'];

/// Turns arbitrary chunks of a streamed JSON array into whole packet objects.
///
/// Incomplete tails stay buffered until more input arrives. Garbage or a
/// buffer that grows past `limit` is discarded and the splitter waits for the
/// next object that opens a line.
#[derive(Debug)]
pub struct FrameSplitter {
    buf: String,
    limit: usize,
    line_start: bool,
    resyncing: bool,
    resyncs: u64,
}

impl FrameSplitter {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
            line_start: true,
            resyncing: false,
            resyncs: 0,
        }
    }

    pub fn push(&mut self, chunk: &str) -> Vec<Value> {
        self.buf.push_str(chunk);
        let mut frames = Vec::new();
        loop {
            if self.resyncing && !self.realign() {
                break;
            }
            let start = self
                .buf
                .find(|c: char| !(c.is_whitespace() || matches!(c, '[' | ']' | ',')));
            match start {
                Some(offset) => self.consume(offset),
                None => {
                    let len = self.buf.len();
                    self.consume(len);
                    break;
                }
            }
            if !self.buf.starts_with('{') {
                warn!(pending = self.buf.len(), "unexpected capture output; resynchronising");
                self.start_resync();
                continue;
            }

            let parsed = {
                let mut stream = serde_json::Deserializer::from_str(&self.buf).into_iter::<Value>();
                stream
                    .next()
                    .map(|result| result.map(|frame| (frame, stream.byte_offset())))
            };
            match parsed {
                Some(Ok((frame, used))) => {
                    self.consume(used);
                    frames.push(frame);
                }
                Some(Err(err)) if err.is_eof() => {
                    if self.buf.len() > self.limit {
                        warn!(
                            pending = self.buf.len(),
                            limit = self.limit,
                            "capture buffer over limit; discarding and resynchronising"
                        );
                        self.buf.clear();
                        self.line_start = false;
                        self.resyncing = true;
                        self.resyncs += 1;
                    }
                    break;
                }
                Some(Err(err)) => {
                    warn!(%err, "unparsable capture frame; resynchronising");
                    // step past the broken opening brace
                    self.consume(1);
                    self.start_resync();
                }
                None => break,
            }
        }
        frames
    }

    /// Bytes waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    fn start_resync(&mut self) {
        self.resyncing = true;
        self.resyncs += 1;
    }

    fn consume(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.line_start = self.buf[..n].ends_with('\n');
        self.buf.drain(..n);
    }

    // Drops text up to the next `{` that opens a line. Returns false when more
    // input is needed to find one.
    fn realign(&mut self) -> bool {
        let line_start = self.line_start;
        let found = line_start
            .then_some(0)
            .into_iter()
            .chain(self.buf.match_indices('\n').map(|(i, _)| i + 1))
            .find(|&i| self.buf[i..].trim_start_matches(INDENT).starts_with('{'));
        match found {
            Some(offset) => {
                self.consume(offset);
                self.resyncing = false;
                true
            }
            None => {
                let tail = match self.buf.rfind('\n') {
                    Some(i) => i + 1,
                    None if line_start => 0,
                    None => self.buf.len(),
                };
                // a partial line can only open an object while it is indentation
                let keep_tail = self.buf[tail..].trim_start_matches(INDENT).is_empty();
                let drop = if keep_tail { tail } else { self.buf.len() };
                self.consume(drop);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tshark_packet(tcp: bool, udp: bool) -> Value {
        let mut layers = json!({
            "frame": {"frame.time_epoch": "1700000000.250000000"},
            "ip": {"ip.src": "192.168.1.1", "ip.dst": "192.168.1.2", "ip.proto": "6", "ip.len": "100"}
        });
        if tcp {
            layers["tcp"] = json!({"tcp.srcport": "12345", "tcp.dstport": "80"});
        }
        if udp {
            layers["udp"] = json!({"udp.srcport": "5353", "udp.dstport": "53"});
        }
        json!({"_index": "packets-2024", "_source": {"layers": layers}})
    }

    #[test]
    fn decodes_tcp_packet() {
        let record = decode_tshark(&tshark_packet(true, false)).unwrap();
        assert_eq!(record.source_addr, "192.168.1.1");
        assert_eq!(record.dest_addr, "192.168.1.2");
        assert_eq!(record.protocol, Protocol::Tcp);
        assert_eq!(record.length, 100);
        assert_eq!(record.source_port, Some(12345));
        assert_eq!(record.dest_port, Some(80));
        assert!((record.timestamp - 1_700_000_000.25).abs() < 1e-6);
    }

    #[test]
    fn tcp_wins_over_udp_and_absent_is_other() {
        assert_eq!(decode_tshark(&tshark_packet(true, true)).unwrap().protocol, Protocol::Tcp);
        assert_eq!(decode_tshark(&tshark_packet(false, true)).unwrap().protocol, Protocol::Udp);
        let other = decode_tshark(&tshark_packet(false, false)).unwrap();
        assert_eq!(other.protocol, Protocol::Other);
        assert_eq!(other.source_port, None);
    }

    #[test]
    fn null_layers_count_as_absent() {
        let mut packet = tshark_packet(false, true);
        packet["_source"]["layers"]["tcp"] = Value::Null;
        assert_eq!(decode_tshark(&packet).unwrap().protocol, Protocol::Udp);
    }

    #[test]
    fn decodes_ipv6_and_rfc3339_time() {
        let packet = json!({"_source": {"layers": {
            "frame": {"frame.time_epoch": "2024-03-01T12:00:00.500Z"},
            "ipv6": {"ipv6.src": "fe80::1", "ipv6.dst": "fe80::2", "ipv6.plen": "40"},
            "udp": {"udp.srcport": "546", "udp.dstport": "547"}
        }}});
        let record = decode_tshark(&packet).unwrap();
        assert_eq!(record.source_addr, "fe80::1");
        assert_eq!(record.length, 40);
        assert!((record.timestamp - 1_709_294_400.5).abs() < 1e-6);
    }

    #[test]
    fn missing_destination_is_reported() {
        let mut packet = tshark_packet(true, false);
        packet["_source"]["layers"]["ip"]
            .as_object_mut()
            .unwrap()
            .remove("ip.dst");
        assert_eq!(decode_tshark(&packet).unwrap_err().field, "ip.dst");
    }

    #[test]
    fn canonical_records_decode_and_validate() {
        let record = decode_canonical(
            r#"{"timestampSeconds":1.0,"sourceAddr":"A","destAddr":"B","protocol":"tcp","lengthBytes":100,"sourcePort":1234}"#,
        )
        .unwrap();
        assert_eq!(record.protocol, Protocol::Tcp);
        assert_eq!(record.source_port, Some(1234));
        assert_eq!(record.dest_port, None);

        let sctp = decode_canonical(
            r#"{"timestampSeconds":1.0,"sourceAddr":"A","destAddr":"B","protocol":"SCTP","lengthBytes":1}"#,
        )
        .unwrap();
        assert_eq!(sctp.protocol, Protocol::Other);

        let missing = decode_canonical(
            r#"{"timestampSeconds":1.0,"sourceAddr":"A","protocol":"TCP","lengthBytes":100}"#,
        )
        .unwrap_err();
        assert_eq!(missing.field, "destAddr");

        let negative = decode_canonical(
            r#"{"timestampSeconds":1.0,"sourceAddr":"A","destAddr":"B","protocol":"UDP","lengthBytes":-4}"#,
        )
        .unwrap_err();
        assert_eq!(negative.field, "lengthBytes");
    }

    #[test]
    fn inspects_tcp_flags_and_http() {
        let mut packet = tshark_packet(true, false);
        let layers = &mut packet["_source"]["layers"];
        layers["tcp"]["tcp.flags_tree"] = json!({"tcp.flags.syn": "1", "tcp.flags.ack": "0"});
        layers["http"] = json!({
            "GET / HTTP/1.1\\r\\n": {
                "http.request.method": "GET",
                "http.request.uri": "/",
                "http.request.version": "HTTP/1.1"
            },
            "http.host": "example.com"
        });
        let info = decode_tshark(&packet).unwrap().info.unwrap();
        let flags = info.tcp_flags.unwrap();
        assert!(flags.syn && !flags.ack && !flags.fin);
        let http = info.http_info.unwrap();
        assert_eq!(http.method.as_deref(), Some("GET"));
        assert_eq!(http.host.as_deref(), Some("example.com"));
        assert_eq!(http.status_code, None);
        assert!(info.dns_info.is_none());
    }

    #[test]
    fn inspects_dns_queries_and_answers() {
        let mut packet = tshark_packet(false, true);
        packet["_source"]["layers"]["dns"] = json!({
            "dns.flags_tree": {"dns.flags.rcode": "0"},
            "Queries": {"example.com: type A, class IN": {"dns.qry.name": "example.com", "dns.qry.type": "1"}},
            "Answers": {
                "example.com: type A, class IN, addr 93.184.216.34": {
                    "dns.resp.name": "example.com", "dns.resp.type": "1", "dns.a": "93.184.216.34"
                }
            }
        });
        let dns = decode_tshark(&packet).unwrap().info.unwrap().dns_info.unwrap();
        assert_eq!(dns.query_name.as_deref(), Some("example.com"));
        assert_eq!(dns.response_code.as_deref(), Some("0"));
        assert_eq!(dns.answers.len(), 1);
        assert_eq!(dns.answers[0].data, "93.184.216.34");
    }

    #[test]
    fn plain_udp_has_no_detail() {
        assert!(decode_tshark(&tshark_packet(false, true)).unwrap().info.is_none());
    }

    fn pretty_stream(packets: &[Value]) -> String {
        let objects: Vec<String> = packets
            .iter()
            .map(|packet| serde_json::to_string_pretty(packet).unwrap())
            .collect();
        format!("[\n{}\n]\n", objects.join("\n,\n"))
    }

    #[test]
    fn splitter_reassembles_arbitrary_chunks() {
        let stream = pretty_stream(&[tshark_packet(true, false), tshark_packet(false, true)]);
        let mut splitter = FrameSplitter::new(1 << 20);
        let mut frames = Vec::new();
        for chunk in stream.as_bytes().chunks(7) {
            frames.extend(splitter.push(std::str::from_utf8(chunk).unwrap()));
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(decode_tshark(&frames[1]).unwrap().protocol, Protocol::Udp);
        assert_eq!(splitter.pending(), 0);
        assert_eq!(splitter.resyncs(), 0);
    }

    #[test]
    fn splitter_skips_garbage_and_recovers() {
        let good = serde_json::to_string_pretty(&tshark_packet(true, false)).unwrap();
        let input = format!("Capturing on 'eth0'\n{{ \"broken\": ]\n{good}\n");
        let mut splitter = FrameSplitter::new(1 << 20);
        let frames = splitter.push(&input);
        assert_eq!(frames.len(), 1);
        assert!(splitter.resyncs() >= 1);
    }

    #[test]
    fn splitter_bounds_runaway_buffer() {
        let mut splitter = FrameSplitter::new(64);
        // an object that never closes
        assert!(splitter.push("{\n  \"a\": \"").is_empty());
        assert!(splitter.push(&"x".repeat(100)).is_empty());
        assert_eq!(splitter.pending(), 0);
        assert_eq!(splitter.resyncs(), 1);

        // the tail of the runaway object is skipped, the next one parses
        let good = serde_json::to_string_pretty(&tshark_packet(false, true)).unwrap();
        let frames = splitter.push(&format!("xxx\"\n}}\n,\n{good}\n"));
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn splitter_drops_unterminated_garbage_lines() {
        let mut splitter = FrameSplitter::new(64);
        for _ in 0..100 {
            assert!(splitter.push(&"x".repeat(1000)).is_empty());
            assert!(splitter.pending() <= 64);
        }
        let good = serde_json::to_string_pretty(&tshark_packet(true, false)).unwrap();
        let frames = splitter.push(&format!("\n{good}\n"));
        assert_eq!(frames.len(), 1);
    }
}
