use bytes::{BufMut, Bytes, BytesMut};

use crate::{BodyCodec, Error, NodeAddress};

/// Wire protocol version, bumped on any incompatible layout change.
pub const WIRE_VERSION: u8 = 1;

const FLAG_SEND: u8 = 0b0000_0001;
const FLAG_REPLY: u8 = 0b0000_0010;

/// A message as it travels between peer nodes.
///
/// `send` distinguishes point-to-point from publish. `from_wire` never
/// travels: it is set on decode and marks a re-entry that must only reach
/// the local bus, never the cluster again.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusteredMessage {
    pub sender: NodeAddress,
    pub address: String,
    pub reply_address: Option<String>,
    pub headers: Vec<(String, String)>,
    pub codec: BodyCodec,
    pub body: Bytes,
    pub send: bool,
    pub from_wire: bool,
}

impl ClusteredMessage {
    /// The keepalive payload. It has no address and no body, only the
    /// reserved codec identity matters to the receiver.
    pub fn ping(sender: NodeAddress) -> Self {
        Self {
            sender,
            address: String::new(),
            reply_address: None,
            headers: Vec::new(),
            codec: BodyCodec::Ping,
            body: Bytes::new(),
            send: true,
            from_wire: false,
        }
    }

    pub fn is_ping(&self) -> bool {
        self.codec == BodyCodec::Ping
    }

    /// Encode into a record payload, without the length framing.
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(64 + self.body.len());

        dst.put_u8(WIRE_VERSION);
        dst.put_u8(self.codec.into());

        let mut flags = 0;
        if self.send {
            flags |= FLAG_SEND;
        }

        if self.reply_address.is_some() {
            flags |= FLAG_REPLY;
        }

        dst.put_u8(flags);

        put_str(&mut dst, &self.address);
        if let Some(reply) = &self.reply_address {
            put_str(&mut dst, reply);
        }

        put_str(&mut dst, &self.sender.host);
        dst.put_u32(self.sender.port as u32);

        dst.put_u16(self.headers.len() as u16);
        for (key, value) in &self.headers {
            put_str(&mut dst, key);
            put_str(&mut dst, value);
        }

        dst.put_u32(self.body.len() as u32);
        dst.put_slice(&self.body);
        dst.freeze()
    }

    /// Decode a record payload.
    ///
    /// The returned message is marked `from_wire`.
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = Reader(bytes);

        let version = reader.get_u8()?;
        if version != WIRE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let codec =
            BodyCodec::try_from(reader.get_u8()?).map_err(|e| Error::UnknownBodyCodec(e.number))?;
        let flags = reader.get_u8()?;

        let address = reader.get_str()?.to_string();
        let reply_address = if flags & FLAG_REPLY != 0 {
            Some(reader.get_str()?.to_string())
        } else {
            None
        };

        let host = reader.get_str()?.to_string();
        let port = reader.get_u32()? as u16;

        let mut headers = Vec::new();
        for _ in 0..reader.get_u16()? {
            let key = reader.get_str()?.to_string();
            let value = reader.get_str()?.to_string();
            headers.push((key, value));
        }

        let size = reader.get_u32()? as usize;
        let body = Bytes::copy_from_slice(reader.get_bytes(size)?);

        Ok(Self {
            sender: NodeAddress::new(host, port),
            address,
            reply_address,
            headers,
            codec,
            body,
            send: flags & FLAG_SEND != 0,
            from_wire: true,
        })
    }
}

fn put_str(dst: &mut BytesMut, value: &str) {
    dst.put_u16(value.len() as u16);
    dst.put_slice(value.as_bytes());
}

/// A checked cursor over a record payload.
struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn get_bytes(&mut self, size: usize) -> Result<&'a [u8], Error> {
        if self.0.len() < size {
            return Err(Error::UnexpectedEnd);
        }

        let (chunk, rest) = self.0.split_at(size);
        self.0 = rest;
        Ok(chunk)
    }

    fn get_u8(&mut self) -> Result<u8, Error> {
        Ok(self.get_bytes(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16, Error> {
        Ok(u16::from_be_bytes(self.get_bytes(2)?.try_into()?))
    }

    fn get_u32(&mut self) -> Result<u32, Error> {
        Ok(u32::from_be_bytes(self.get_bytes(4)?.try_into()?))
    }

    fn get_str(&mut self) -> Result<&'a str, Error> {
        let size = self.get_u16()? as usize;
        Ok(std::str::from_utf8(self.get_bytes(size)?)?)
    }
}
