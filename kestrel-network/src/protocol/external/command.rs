//! The twelve byte, NUL-padded command field of a message header.

use std::fmt;

use kestrel_chain::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// A Bitcoin message command.
///
/// The command names a message type; the codec uses it to pick a payload
/// parser. Commands we do not speak are preserved as `Unknown` so the peer
/// is not penalized for extensions we have not implemented.
#[derive(Clone, Copy, Eq, PartialEq)]
pub enum Command {
    Version,
    Verack,
    Ping,
    Pong,
    Reject,
    GetAddr,
    Addr,
    GetBlocks,
    Inv,
    GetHeaders,
    Headers,
    GetData,
    Tx,
    NotFound,
    MemPool,
    FilterLoad,
    MerkleBlock,
    /// A command this wallet does not speak; logged and skipped.
    Unknown([u8; 12]),
}

impl Command {
    /// The wire form: ASCII name, NUL-padded to twelve bytes.
    pub fn bytes(&self) -> [u8; 12] {
        let name: &[u8] = match self {
            Command::Version => b"version",
            Command::Verack => b"verack",
            Command::Ping => b"ping",
            Command::Pong => b"pong",
            Command::Reject => b"reject",
            Command::GetAddr => b"getaddr",
            Command::Addr => b"addr",
            Command::GetBlocks => b"getblocks",
            Command::Inv => b"inv",
            Command::GetHeaders => b"getheaders",
            Command::Headers => b"headers",
            Command::GetData => b"getdata",
            Command::Tx => b"tx",
            Command::NotFound => b"notfound",
            Command::MemPool => b"mempool",
            Command::FilterLoad => b"filterload",
            Command::MerkleBlock => b"merkleblock",
            Command::Unknown(raw) => return *raw,
        };
        let mut bytes = [0u8; 12];
        bytes[..name.len()].copy_from_slice(name);
        bytes
    }

    fn from_bytes(raw: [u8; 12]) -> Command {
        match &raw {
            b"version\0\0\0\0\0" => Command::Version,
            b"verack\0\0\0\0\0\0" => Command::Verack,
            b"ping\0\0\0\0\0\0\0\0" => Command::Ping,
            b"pong\0\0\0\0\0\0\0\0" => Command::Pong,
            b"reject\0\0\0\0\0\0" => Command::Reject,
            b"getaddr\0\0\0\0\0" => Command::GetAddr,
            b"addr\0\0\0\0\0\0\0\0" => Command::Addr,
            b"getblocks\0\0\0" => Command::GetBlocks,
            b"inv\0\0\0\0\0\0\0\0\0" => Command::Inv,
            b"getheaders\0\0" => Command::GetHeaders,
            b"headers\0\0\0\0\0" => Command::Headers,
            b"getdata\0\0\0\0\0" => Command::GetData,
            b"tx\0\0\0\0\0\0\0\0\0\0" => Command::Tx,
            b"notfound\0\0\0\0" => Command::NotFound,
            b"mempool\0\0\0\0\0" => Command::MemPool,
            b"filterload\0\0" => Command::FilterLoad,
            b"merkleblock\0" => Command::MerkleBlock,
            _ => Command::Unknown(raw),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = self.bytes();
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(12);
        let escaped: String = bytes[..end]
            .iter()
            .cloned()
            .flat_map(std::ascii::escape_default)
            .map(char::from)
            .collect();
        f.debug_tuple("Command").field(&escaped).finish()
    }
}

impl BitcoinSerialize for Command {
    fn bitcoin_serialize<W: std::io::Write>(&self, mut target: W) -> Result<(), std::io::Error> {
        target.write_all(&self.bytes())
    }
}

impl BitcoinDeserialize for Command {
    fn bitcoin_deserialize<R: std::io::Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(Command::from_bytes(<[u8; 12]>::bitcoin_deserialize(
            reader,
        )?))
    }
}
