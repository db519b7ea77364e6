// Generic BER tree codec for LDAP v3 envelopes.
// Messages are ordered trees of tagged nodes; the session core walks and
// builds these trees, it never works on raw bytes itself.

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Cap on constructed-node nesting. LDAP envelopes are a few levels deep;
/// anything past this is a hostile stream, not a message.
const MAX_PARSE_DEPTH: usize = 64;

/// Cap on a single envelope's on-wire size. The length field alone allows
/// 4 GiB claims; nothing this server exchanges comes near this limit.
const MAX_ENVELOPE_SIZE: usize = 8 * 1024 * 1024;

pub const TAG_BOOLEAN: u8 = 0x01;
pub const TAG_INTEGER: u8 = 0x02;
pub const TAG_OCTET_STRING: u8 = 0x04;
pub const TAG_ENUMERATED: u8 = 0x0A;
pub const TAG_SEQUENCE: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BerClass {
    Universal,
    Application,
    Context,
    Private,
}

impl BerClass {
    fn from_identifier(b: u8) -> Self {
        match b & 0xC0 {
            0x00 => BerClass::Universal,
            0x40 => BerClass::Application,
            0x80 => BerClass::Context,
            _ => BerClass::Private,
        }
    }

    fn bits(self) -> u8 {
        match self {
            BerClass::Universal => 0x00,
            BerClass::Application => 0x40,
            BerClass::Context => 0x80,
            BerClass::Private => 0xC0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BerType {
    Primitive,
    Constructed,
}

/// Decoded scalar payload of a primitive node. Only universal integer,
/// enumerated, boolean and octet-string content is interpreted; everything
/// else stays raw in `BerNode::content`.
#[derive(Debug, Clone, PartialEq)]
pub enum BerValue {
    None,
    Integer(i64),
    Text(String),
    Boolean(bool),
}

#[derive(Debug, Clone)]
pub struct BerNode {
    pub class: BerClass,
    pub ber_type: BerType,
    pub tag: u8,
    pub value: BerValue,
    /// Raw content octets for primitive nodes (empty for constructed ones).
    pub content: Vec<u8>,
    pub children: Vec<BerNode>,
}

impl BerNode {
    pub fn sequence(class: BerClass, tag: u8) -> Self {
        Self {
            class,
            ber_type: BerType::Constructed,
            tag,
            value: BerValue::None,
            content: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn integer(class: BerClass, tag: u8, value: i64) -> Self {
        Self {
            class,
            ber_type: BerType::Primitive,
            tag,
            value: BerValue::Integer(value),
            content: encode_integer_bytes(value),
            children: Vec::new(),
        }
    }

    pub fn enumerated(value: i64) -> Self {
        Self::integer(BerClass::Universal, TAG_ENUMERATED, value)
    }

    pub fn octet_string(s: &str) -> Self {
        Self::text(BerClass::Universal, TAG_OCTET_STRING, s)
    }

    /// Primitive string node with an arbitrary class and tag (e.g. the
    /// context-[0] simple-auth credential of a bind request).
    pub fn text(class: BerClass, tag: u8, s: &str) -> Self {
        Self {
            class,
            ber_type: BerType::Primitive,
            tag,
            value: BerValue::Text(s.to_string()),
            content: s.as_bytes().to_vec(),
            children: Vec::new(),
        }
    }

    pub fn boolean(value: bool) -> Self {
        Self {
            class: BerClass::Universal,
            ber_type: BerType::Primitive,
            tag: TAG_BOOLEAN,
            value: BerValue::Boolean(value),
            content: vec![if value { 0xFF } else { 0x00 }],
            children: Vec::new(),
        }
    }

    pub fn append(&mut self, child: BerNode) {
        self.children.push(child);
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.value {
            BerValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Non-negative integer value, e.g. a message identifier.
    pub fn as_unsigned(&self) -> Option<u64> {
        match self.value {
            BerValue::Integer(v) if v >= 0 => Some(v as u64),
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let constructed = match self.ber_type {
            BerType::Constructed => 0x20,
            BerType::Primitive => 0x00,
        };
        out.push(self.class.bits() | constructed | (self.tag & 0x1F));
        let content = match self.ber_type {
            BerType::Primitive => self.content.clone(),
            BerType::Constructed => {
                let mut inner = Vec::new();
                for child in &self.children {
                    child.encode_into(&mut inner);
                }
                inner
            }
        };
        write_length(out, content.len());
        out.extend_from_slice(&content);
    }
}

/// Minimal two's-complement encoding of an INTEGER / ENUMERATED value.
fn encode_integer_bytes(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let cur = bytes[start];
        let next = bytes[start + 1];
        let redundant = (cur == 0x00 && next & 0x80 == 0) || (cur == 0xFF && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

fn write_length(out: &mut Vec<u8>, length: usize) {
    if length < 128 {
        out.push(length as u8);
    } else {
        let mut bytes = Vec::new();
        let mut len = length;
        while len > 0 {
            bytes.push((len & 0xFF) as u8);
            len >>= 8;
        }
        bytes.reverse();
        out.push(0x80 | bytes.len() as u8);
        out.extend_from_slice(&bytes);
    }
}

/// Parse one complete envelope. Trailing bytes after the first TLV are an
/// error; framing is expected to hand us exactly one message.
pub fn parse(data: &[u8]) -> Result<BerNode> {
    let (node, used) = parse_tlv(data, 0)?;
    if used != data.len() {
        bail!("{} trailing bytes after BER element", data.len() - used);
    }
    Ok(node)
}

fn parse_tlv(data: &[u8], depth: usize) -> Result<(BerNode, usize)> {
    if depth > MAX_PARSE_DEPTH {
        bail!("BER nesting deeper than {} levels", MAX_PARSE_DEPTH);
    }
    if data.len() < 2 {
        bail!("BER element truncated: {} bytes", data.len());
    }
    let identifier = data[0];
    let tag = identifier & 0x1F;
    if tag == 0x1F {
        bail!("high-tag-number form not supported");
    }
    let class = BerClass::from_identifier(identifier);
    let ber_type = if identifier & 0x20 != 0 {
        BerType::Constructed
    } else {
        BerType::Primitive
    };

    let (length, header) = parse_length(&data[1..]).context("invalid BER length")?;
    let start = 1 + header;
    let end = start
        .checked_add(length)
        .filter(|&e| e <= data.len())
        .context("BER content exceeds available bytes")?;
    let content = &data[start..end];

    let node = match ber_type {
        BerType::Constructed => {
            let mut children = Vec::new();
            let mut offset = 0;
            while offset < content.len() {
                let (child, used) = parse_tlv(&content[offset..], depth + 1)?;
                children.push(child);
                offset += used;
            }
            BerNode {
                class,
                ber_type,
                tag,
                value: BerValue::None,
                content: Vec::new(),
                children,
            }
        }
        BerType::Primitive => {
            let value = if class == BerClass::Universal {
                decode_universal_value(tag, content)?
            } else {
                BerValue::None
            };
            BerNode {
                class,
                ber_type,
                tag,
                value,
                content: content.to_vec(),
                children: Vec::new(),
            }
        }
    };
    Ok((node, end))
}

fn decode_universal_value(tag: u8, content: &[u8]) -> Result<BerValue> {
    match tag {
        TAG_INTEGER | TAG_ENUMERATED => {
            if content.len() > 8 {
                bail!("integer too large: {} bytes", content.len());
            }
            let mut value: i64 = if content.first().map_or(false, |&b| b & 0x80 != 0) {
                -1
            } else {
                0
            };
            for &b in content {
                value = (value << 8) | b as i64;
            }
            Ok(BerValue::Integer(value))
        }
        TAG_BOOLEAN => {
            if content.len() != 1 {
                bail!("boolean must be 1 byte, got {}", content.len());
            }
            Ok(BerValue::Boolean(content[0] != 0))
        }
        TAG_OCTET_STRING => Ok(BerValue::Text(
            String::from_utf8_lossy(content).into_owned(),
        )),
        _ => Ok(BerValue::None),
    }
}

/// Returns (content_length, length_field_bytes).
fn parse_length(data: &[u8]) -> Result<(usize, usize)> {
    let first = *data.first().context("missing length byte")?;
    if first & 0x80 == 0 {
        return Ok((first as usize, 1));
    }
    let length_bytes = (first & 0x7F) as usize;
    if length_bytes == 0 {
        bail!("indefinite length not supported");
    }
    if length_bytes > 4 {
        bail!("length too large: {} bytes", length_bytes);
    }
    if data.len() < 1 + length_bytes {
        bail!("length field truncated");
    }
    let mut length = 0usize;
    for i in 0..length_bytes {
        length = (length << 8) | data[1 + i] as usize;
    }
    Ok((length, 1 + length_bytes))
}

/// Total on-wire size of the TLV at the start of `buf`, or None if more
/// bytes are needed to tell.
fn framed_length(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let first = buf[1];
    if first & 0x80 == 0 {
        return Ok(Some(2 + first as usize));
    }
    let length_bytes = (first & 0x7F) as usize;
    if length_bytes == 0 || length_bytes > 4 {
        bail!("invalid length encoding");
    }
    if buf.len() < 2 + length_bytes {
        return Ok(None);
    }
    let mut length = 0usize;
    for i in 0..length_bytes {
        length = (length << 8) | buf[2 + i] as usize;
    }
    if length > MAX_ENVELOPE_SIZE {
        bail!(
            "envelope of {} bytes exceeds the {} byte limit",
            length,
            MAX_ENVELOPE_SIZE
        );
    }
    Ok(Some(2 + length_bytes + length))
}

/// Take one complete envelope off the front of `buf`. `None` means the
/// buffer holds only a partial message; an error means the stream is
/// malformed and the session must terminate (no partial envelope is ever
/// delivered).
pub fn take_envelope(buf: &mut BytesMut) -> Result<Option<BerNode>> {
    let total = match framed_length(buf)? {
        Some(t) => t,
        None => return Ok(None),
    };
    if buf.len() < total {
        return Ok(None);
    }
    let frame = buf.split_to(total);
    let node = parse(&frame).context("failed to parse LDAP envelope")?;
    Ok(Some(node))
}

/// Blocking read of the next envelope. `None` signals a clean end of
/// stream between messages; EOF in the middle of one is an error.
pub async fn read_envelope<S>(stream: &mut S, buf: &mut BytesMut) -> Result<Option<BerNode>>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(node) = take_envelope(buf)? {
            return Ok(Some(node));
        }
        let n = stream.read_buf(buf).await.context("read from client")?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            bail!("connection closed mid-message ({} bytes pending)", buf.len());
        }
    }
}
