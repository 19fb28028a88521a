//! ICE candidate handling and the STUN binding subset needed for
//! connectivity checks: candidate parsing/formatting, host and
//! server-reflexive gathering, and integrity-protected binding
//! requests/responses (RFC 5389 / RFC 8445, IPv4 only).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

type HmacSha1 = Hmac<Sha1>;

const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;

const ATTR_USERNAME: u16 = 0x0006;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_PRIORITY: u16 = 0x0024;
const ATTR_USE_CANDIDATE: u16 = 0x0025;
const ATTR_ICE_CONTROLLED: u16 = 0x8029;
const ATTR_ICE_CONTROLLING: u16 = 0x802A;

/// Per-attempt wait for a binding response.
pub const CHECK_TIMEOUT: Duration = Duration::from_millis(500);
/// Retransmissions per candidate before giving up on it.
pub const CHECK_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl CandidateType {
    fn as_sdp(&self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        }
    }

    /// Type preference used in the RFC 8445 priority formula.
    fn preference(&self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

/// One `a=candidate` line, decomposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u8,
    pub transport: Transport,
    pub priority: u32,
    pub address: IpAddr,
    pub port: u16,
    pub candidate_type: CandidateType,
    pub related_address: Option<IpAddr>,
    pub related_port: Option<u16>,
}

impl IceCandidate {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn to_sdp_line(&self) -> String {
        let transport = match self.transport {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        };
        let mut line = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            transport,
            self.priority,
            self.address,
            self.port,
            self.candidate_type.as_sdp()
        );
        if let (Some(raddr), Some(rport)) = (self.related_address, self.related_port) {
            line.push_str(&format!(" raddr {} rport {}", raddr, rport));
        }
        line
    }
}

/// Parses a candidate attribute, with or without the `a=` prefix and with or
/// without the `candidate:` prefix (browsers differ on what they put in the
/// `candidate` field of the envelope payload).
pub fn parse_candidate(line: &str) -> Result<IceCandidate> {
    let line = line.trim();
    let line = line.strip_prefix("a=").unwrap_or(line);
    let line = line.strip_prefix("candidate:").unwrap_or(line);

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 8 {
        bail!("candidate line too short: {} fields", fields.len());
    }

    let transport = match fields[2].to_ascii_lowercase().as_str() {
        "udp" => Transport::Udp,
        "tcp" => Transport::Tcp,
        other => bail!("unknown candidate transport {other:?}"),
    };

    if fields[6] != "typ" {
        bail!("expected 'typ' at field 7, found {:?}", fields[6]);
    }
    let candidate_type = match fields[7] {
        "host" => CandidateType::Host,
        "srflx" => CandidateType::ServerReflexive,
        "prflx" => CandidateType::PeerReflexive,
        "relay" => CandidateType::Relay,
        other => bail!("unknown candidate type {other:?}"),
    };

    let mut related_address = None;
    let mut related_port = None;
    let mut rest = fields[8..].iter();
    while let Some(key) = rest.next() {
        match *key {
            "raddr" => {
                related_address = rest
                    .next()
                    .map(|v| v.parse::<IpAddr>())
                    .transpose()
                    .context("bad raddr")?;
            }
            "rport" => {
                related_port = rest
                    .next()
                    .map(|v| v.parse::<u16>())
                    .transpose()
                    .context("bad rport")?;
            }
            // Extension attributes (generation, network-cost, ...) are
            // ignored.
            _ => {
                rest.next();
            }
        }
    }

    Ok(IceCandidate {
        foundation: fields[0].to_string(),
        component: fields[1].parse().context("bad component id")?,
        transport,
        priority: fields[3].parse().context("bad priority")?,
        address: fields[4].parse().context("bad connection address")?,
        port: fields[5].parse().context("bad port")?,
        candidate_type,
        related_address,
        related_port,
    })
}

/// RFC 8445 §5.1.2.1, single-homed local preference.
pub fn compute_priority(candidate_type: CandidateType, component: u8) -> u32 {
    (candidate_type.preference() << 24) + (65535 << 8) + (256 - component as u32)
}

/// ICE credentials for one agent. The ufrag/pwd alphabet and lengths follow
/// what browsers emit.
#[derive(Debug, Clone)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn generate() -> Result<Self> {
        Ok(IceCredentials {
            ufrag: random_token(4)?,
            pwd: random_token(22)?,
        })
    }
}

fn random_token(len: usize) -> Result<String> {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789+/";
    let mut raw = vec![0u8; len];
    getrandom::getrandom(&mut raw).map_err(|e| anyhow!("rng failure: {e}"))?;
    Ok(raw
        .iter()
        .map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char)
        .collect())
}

/// Local interface address as seen by the default route. No packet is sent;
/// connecting a UDP socket just selects the outbound interface.
pub async fn default_route_ip() -> Result<IpAddr> {
    let probe = UdpSocket::bind("0.0.0.0:0").await?;
    probe.connect("8.8.8.8:80").await?;
    Ok(probe.local_addr()?.ip())
}

/// Builds the host candidate for an already-bound socket.
pub async fn host_candidate(socket: &UdpSocket) -> Result<IceCandidate> {
    let port = socket.local_addr()?.port();
    let address = match default_route_ip().await {
        Ok(ip) => ip,
        Err(e) => {
            debug!("no default route ({e}), using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    };
    Ok(IceCandidate {
        foundation: "1".to_string(),
        component: 1,
        transport: Transport::Udp,
        priority: compute_priority(CandidateType::Host, 1),
        address,
        port,
        candidate_type: CandidateType::Host,
        related_address: None,
        related_port: None,
    })
}

/// Discovers the server-reflexive candidate by asking a STUN server what it
/// sees. Returns `None` when the mapped address equals the host address (no
/// NAT between us and the server).
pub async fn srflx_candidate(
    socket: &UdpSocket,
    stun_server: &str,
    host: &IceCandidate,
) -> Result<Option<IceCandidate>> {
    let txn = new_transaction_id()?;
    let request = encode_message(BINDING_REQUEST, &txn, &[], None);
    socket.send_to(&request, stun_server).await?;

    let mut buf = [0u8; 1024];
    let (len, _) = timeout(CHECK_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .context("STUN server did not answer")??;
    let msg = parse_message(&buf[..len])?;
    if msg.transaction_id != txn {
        bail!("STUN response for a different transaction");
    }
    let mapped = msg
        .xor_mapped_address
        .context("STUN response without XOR-MAPPED-ADDRESS")?;

    if mapped.ip() == host.address && mapped.port() == host.port {
        return Ok(None);
    }
    Ok(Some(IceCandidate {
        foundation: "2".to_string(),
        component: 1,
        transport: Transport::Udp,
        priority: compute_priority(CandidateType::ServerReflexive, 1),
        address: mapped.ip(),
        port: mapped.port(),
        candidate_type: CandidateType::ServerReflexive,
        related_address: Some(host.address),
        related_port: Some(host.port),
    }))
}

/// FIFO buffer for remote candidates that arrive before the remote
/// description is set. Drained exactly once when the description lands.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: Vec<IceCandidate>,
}

impl CandidateBuffer {
    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push(candidate);
    }

    pub fn drain(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// --- STUN wire format -------------------------------------------------------

#[derive(Debug)]
pub struct StunMessage {
    pub message_type: u16,
    pub transaction_id: [u8; 12],
    pub xor_mapped_address: Option<SocketAddr>,
    pub username: Option<String>,
    pub priority: Option<u32>,
    integrity_offset: Option<usize>,
    integrity_value: Option<[u8; 20]>,
}

impl StunMessage {
    pub fn is_binding_request(&self) -> bool {
        self.message_type == BINDING_REQUEST
    }

    pub fn is_binding_success(&self) -> bool {
        self.message_type == BINDING_SUCCESS
    }
}

pub fn new_transaction_id() -> Result<[u8; 12]> {
    let mut txn = [0u8; 12];
    getrandom::getrandom(&mut txn).map_err(|e| anyhow!("rng failure: {e}"))?;
    Ok(txn)
}

struct Attr<'a> {
    kind: u16,
    value: &'a [u8],
}

/// Encodes a STUN message. When `integrity_key` is set, a MESSAGE-INTEGRITY
/// attribute (HMAC-SHA1 over the preceding message with an adjusted length
/// field) is appended last.
fn encode_message(
    message_type: u16,
    transaction_id: &[u8; 12],
    attrs: &[Attr<'_>],
    integrity_key: Option<&[u8]>,
) -> Vec<u8> {
    let mut msg = Vec::with_capacity(128);
    msg.extend_from_slice(&message_type.to_be_bytes());
    msg.extend_from_slice(&[0, 0]); // length, patched below
    msg.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(transaction_id);

    for attr in attrs {
        push_attr(&mut msg, attr.kind, attr.value);
    }

    if let Some(key) = integrity_key {
        // The HMAC covers the header with the length field counting the
        // yet-to-be-appended MESSAGE-INTEGRITY attribute (24 bytes).
        let hashed_len = (msg.len() - 20 + 24) as u16;
        msg[2..4].copy_from_slice(&hashed_len.to_be_bytes());
        let digest = hmac_sha1(key, &msg);
        push_attr(&mut msg, ATTR_MESSAGE_INTEGRITY, &digest);
    }

    let final_len = (msg.len() - 20) as u16;
    msg[2..4].copy_from_slice(&final_len.to_be_bytes());
    msg
}

fn push_attr(msg: &mut Vec<u8>, kind: u16, value: &[u8]) {
    msg.extend_from_slice(&kind.to_be_bytes());
    msg.extend_from_slice(&(value.len() as u16).to_be_bytes());
    msg.extend_from_slice(value);
    // Attributes are padded to 4-byte boundaries.
    let pad = (4 - value.len() % 4) % 4;
    msg.extend_from_slice(&[0u8; 3][..pad]);
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; 20] {
    // HMAC accepts keys of any length, so new_from_slice cannot fail.
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Builds the connectivity-check binding request for one candidate pair.
pub fn binding_request(
    transaction_id: &[u8; 12],
    remote_ufrag: &str,
    local_ufrag: &str,
    remote_pwd: &str,
    priority: u32,
    controlling: bool,
    tie_breaker: u64,
) -> Vec<u8> {
    let username = format!("{remote_ufrag}:{local_ufrag}");
    let role_attr = if controlling {
        ATTR_ICE_CONTROLLING
    } else {
        ATTR_ICE_CONTROLLED
    };
    let tie = tie_breaker.to_be_bytes();
    let prio = priority.to_be_bytes();
    let mut attrs = vec![
        Attr {
            kind: ATTR_USERNAME,
            value: username.as_bytes(),
        },
        Attr {
            kind: ATTR_PRIORITY,
            value: &prio,
        },
        Attr {
            kind: role_attr,
            value: &tie,
        },
    ];
    if controlling {
        // Aggressive nomination: nominate on every check.
        attrs.push(Attr {
            kind: ATTR_USE_CANDIDATE,
            value: &[],
        });
    }
    encode_message(
        BINDING_REQUEST,
        transaction_id,
        &attrs,
        Some(remote_pwd.as_bytes()),
    )
}

/// Builds the success response to a binding request, echoing the source
/// address in XOR-MAPPED-ADDRESS.
pub fn binding_response(
    transaction_id: &[u8; 12],
    source: SocketAddr,
    local_pwd: &str,
) -> Vec<u8> {
    let xor = xor_address_bytes(source, transaction_id);
    let attrs = [Attr {
        kind: ATTR_XOR_MAPPED_ADDRESS,
        value: &xor,
    }];
    encode_message(
        BINDING_SUCCESS,
        transaction_id,
        &attrs,
        Some(local_pwd.as_bytes()),
    )
}

fn xor_address_bytes(addr: SocketAddr, _transaction_id: &[u8; 12]) -> Vec<u8> {
    let cookie = STUN_MAGIC_COOKIE.to_be_bytes();
    let mut out = vec![0u8, 0x01]; // family: IPv4
    let port = addr.port() ^ (STUN_MAGIC_COOKIE >> 16) as u16;
    out.extend_from_slice(&port.to_be_bytes());
    match addr.ip() {
        IpAddr::V4(v4) => {
            for (octet, c) in v4.octets().iter().zip(cookie.iter()) {
                out.push(octet ^ c);
            }
        }
        // IPv6 peers are not gathered or checked.
        IpAddr::V6(_) => out.extend_from_slice(&cookie),
    }
    out
}

/// True when `data` plausibly starts a STUN message (first two bits zero,
/// correct magic cookie). Used to split STUN from media on the shared socket.
pub fn looks_like_stun(data: &[u8]) -> bool {
    data.len() >= 20
        && data[0] & 0xC0 == 0
        && data[4..8] == STUN_MAGIC_COOKIE.to_be_bytes()
}

pub fn parse_message(data: &[u8]) -> Result<StunMessage> {
    if !looks_like_stun(data) {
        bail!("not a STUN message");
    }
    let message_type = u16::from_be_bytes([data[0], data[1]]);
    let declared_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() < 20 + declared_len {
        bail!("truncated STUN message");
    }
    let mut transaction_id = [0u8; 12];
    transaction_id.copy_from_slice(&data[8..20]);

    let mut msg = StunMessage {
        message_type,
        transaction_id,
        xor_mapped_address: None,
        username: None,
        priority: None,
        integrity_offset: None,
        integrity_value: None,
    };

    let mut pos = 20;
    let end = 20 + declared_len;
    while pos + 4 <= end {
        let kind = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let value_start = pos + 4;
        if value_start + len > end {
            bail!("attribute overruns message");
        }
        let value = &data[value_start..value_start + len];
        match kind {
            ATTR_XOR_MAPPED_ADDRESS => {
                msg.xor_mapped_address = decode_xor_address(value);
            }
            ATTR_USERNAME => {
                msg.username = Some(String::from_utf8_lossy(value).into_owned());
            }
            ATTR_PRIORITY if len == 4 => {
                msg.priority = Some(u32::from_be_bytes([
                    value[0], value[1], value[2], value[3],
                ]));
            }
            ATTR_MESSAGE_INTEGRITY if len == 20 => {
                msg.integrity_offset = Some(pos);
                let mut digest = [0u8; 20];
                digest.copy_from_slice(value);
                msg.integrity_value = Some(digest);
            }
            _ => trace!("ignoring STUN attribute 0x{kind:04x}"),
        }
        pos = value_start + len + (4 - len % 4) % 4;
    }
    Ok(msg)
}

fn decode_xor_address(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 8 || value[1] != 0x01 {
        return None;
    }
    let cookie = STUN_MAGIC_COOKIE.to_be_bytes();
    let port = u16::from_be_bytes([value[2], value[3]]) ^ (STUN_MAGIC_COOKIE >> 16) as u16;
    let ip = Ipv4Addr::new(
        value[4] ^ cookie[0],
        value[5] ^ cookie[1],
        value[6] ^ cookie[2],
        value[7] ^ cookie[3],
    );
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Verifies MESSAGE-INTEGRITY against `key`. Messages without the attribute
/// fail verification.
pub fn verify_integrity(data: &[u8], msg: &StunMessage, key: &[u8]) -> bool {
    let (offset, expected) = match (msg.integrity_offset, msg.integrity_value) {
        (Some(o), Some(v)) => (o, v),
        _ => return false,
    };
    // Recompute over the message up to the attribute, with the length field
    // set to end at the attribute (offset - 20 header bytes + 24 attr bytes).
    let mut covered = data[..offset].to_vec();
    let adjusted = (offset - 20 + 24) as u16;
    covered[2..4].copy_from_slice(&adjusted.to_be_bytes());
    hmac_sha1(key, &covered) == expected
}

/// One connectivity check against a single remote candidate: up to
/// [`CHECK_MAX_RETRIES`] retransmissions, answering any binding requests the
/// peer sends us in the meantime so its own checks keep making progress.
pub async fn check_candidate(
    socket: &UdpSocket,
    remote: SocketAddr,
    local_creds: &IceCredentials,
    remote_creds: &IceCredentials,
    controlling: bool,
    tie_breaker: u64,
) -> Result<SocketAddr> {
    let mut buf = [0u8; 1500];
    for attempt in 0..CHECK_MAX_RETRIES {
        let txn = new_transaction_id()?;
        let request = binding_request(
            &txn,
            &remote_creds.ufrag,
            &local_creds.ufrag,
            &remote_creds.pwd,
            compute_priority(CandidateType::PeerReflexive, 1),
            controlling,
            tie_breaker,
        );
        socket.send_to(&request, remote).await?;
        trace!("binding request -> {remote} (attempt {})", attempt + 1);

        let deadline = Instant::now() + CHECK_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (len, from) = match timeout(remaining, socket.recv_from(&mut buf)).await {
                Ok(Ok(recv)) => recv,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => break, // retransmit
            };
            let msg = match parse_message(&buf[..len]) {
                Ok(m) => m,
                Err(_) => continue, // media or junk on the shared socket
            };
            if msg.is_binding_request() {
                respond_to_request(socket, &buf[..len], &msg, from, local_creds).await;
                continue;
            }
            if msg.is_binding_success() && msg.transaction_id == txn {
                if !verify_integrity(&buf[..len], &msg, local_creds.pwd.as_bytes()) {
                    warn!("binding response from {from} failed integrity check");
                    continue;
                }
                debug!("candidate {remote} reachable (mapped {:?})", msg.xor_mapped_address);
                return Ok(from);
            }
        }
    }
    Err(anyhow!("no binding response from {remote}"))
}

/// Answers a verified binding request. Requests with bad credentials are
/// dropped without a reply.
pub async fn respond_to_request(
    socket: &UdpSocket,
    raw: &[u8],
    msg: &StunMessage,
    from: SocketAddr,
    local_creds: &IceCredentials,
) {
    if !verify_integrity(raw, msg, local_creds.pwd.as_bytes()) {
        debug!("binding request from {from} failed integrity check, ignoring");
        return;
    }
    if let Some(username) = &msg.username {
        if !username.starts_with(&format!("{}:", local_creds.ufrag)) {
            debug!("binding request from {from} with foreign username {username:?}");
            return;
        }
    }
    let response = binding_response(&msg.transaction_id, from, &local_creds.pwd);
    if let Err(e) = socket.send_to(&response, from).await {
        warn!("failed to answer binding request from {from}: {e}");
    }
}
