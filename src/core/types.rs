use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// BLAKE3 digest of `data`.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Concatenate two byte slices and hash them with BLAKE3.
pub fn hash_concat(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(a);
    hasher.update(b);
    *hasher.finalize().as_bytes()
}

/// Short display: first 8 hex chars + "…" + last 4 hex chars
pub fn short_hex(bytes: &[u8; 32]) -> String {
    let h = hex::encode(bytes);
    format!("{}…{}", &h[..8], &h[60..])
}

pub(crate) fn parse_hex32(s: &str) -> Result<[u8; 32], hex::FromHexError> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(s, &mut out)?;
    Ok(out)
}

/// 32-byte identifiers rendered as lowercase hex on the wire and in logs.
macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            pub fn short(&self) -> String {
                short_hex(&self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_hex32(s).map(Self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_id!(
    /// Transaction id (BLAKE3 of the witness-stripped transaction).
    Txid
);
hex_id!(
    /// Round id: a commitment to the round's parameters.
    RoundId
);
hex_id!(
    /// Opaque id handed to a participant when an input is registered.
    AliceId
);

impl AliceId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

/// Reference to a previous transaction output.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Txid,
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: Txid, index: u32) -> Self {
        Self { txid, index }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

impl fmt::Debug for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid.short(), self.index)
    }
}

impl FromStr for OutPoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (txid, index) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("outpoint must be <txid>:<index>"))?;
        Ok(Self {
            txid: txid.parse()?,
            index: index.parse()?,
        })
    }
}

/// Largest locking script a Bob may register.
pub const MAX_SCRIPT_PUBKEY_LEN: usize = 33;

/// Outputs below this value are rejected as non-standard.
pub const DUST_THRESHOLD: u64 = 294;

/// Shared transaction overhead in virtual bytes (version, locktime, counts, segwit marker).
pub const SHARED_OVERHEAD_VSIZE: u64 = 11;

/// Script templates the coordinator knows how to size and, for P2WPKH, validate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptType {
    P2wpkh,
    P2sh,
    P2pkh,
}

impl ScriptType {
    /// Virtual size of an input spending this script type.
    pub fn input_vsize(&self) -> u64 {
        match self {
            ScriptType::P2wpkh => 68,
            ScriptType::P2sh => 91,
            ScriptType::P2pkh => 148,
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScriptType::P2wpkh => "p2wpkh",
            ScriptType::P2sh => "p2sh",
            ScriptType::P2pkh => "p2pkh",
        };
        f.write_str(s)
    }
}

/// Raw locking script bytes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ScriptPubKey(pub Vec<u8>);

impl ScriptPubKey {
    /// Pay-to-witness-key-hash over a compressed public key:
    /// `OP_0 <20-byte BLAKE3 prefix of the key>`.
    pub fn p2wpkh(public_key: &[u8; 33]) -> Self {
        let digest = hash(public_key);
        let mut script = Vec::with_capacity(22);
        script.extend_from_slice(&[0x00, 0x14]);
        script.extend_from_slice(&digest[..20]);
        Self(script)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn script_type(&self) -> Option<ScriptType> {
        let s = &self.0;
        match s.len() {
            22 if s[0] == 0x00 && s[1] == 0x14 => Some(ScriptType::P2wpkh),
            23 if s[0] == 0xa9 && s[1] == 0x14 && s[22] == 0x87 => Some(ScriptType::P2sh),
            25 if s[0] == 0x76 && s[1] == 0xa9 && s[2] == 0x14 && s[23] == 0x88 && s[24] == 0xac => {
                Some(ScriptType::P2pkh)
            }
            _ => None,
        }
    }

    /// Virtual size of an output paying to this script.
    pub fn output_vsize(&self) -> u64 {
        8 + 1 + self.0.len() as u64
    }
}

impl fmt::Debug for ScriptPubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptPubKey({})", hex::encode(&self.0))
    }
}

impl fmt::Display for ScriptPubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl FromStr for ScriptPubKey {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        hex::decode(s).map(Self)
    }
}

impl Serialize for ScriptPubKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ScriptPubKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A transaction output: value in satoshis plus its locking script.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: ScriptPubKey,
}

/// Mining fee rate in satoshis per 1000 virtual bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeeRate(pub u64);

impl FeeRate {
    /// Fee for `vsize` virtual bytes, rounded up.
    pub fn fee(&self, vsize: u64) -> u64 {
        (self.0 * vsize).div_ceil(1000)
    }
}

/// Coordination fee in parts per million of the registered amount.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoordinationFeeRate(pub u32);

impl CoordinationFeeRate {
    pub fn fee(&self, amount: u64) -> u64 {
        ((amount as u128 * self.0 as u128) / 1_000_000) as u64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Main,
    Test,
    Regtest,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Network::Main => "main",
            Network::Test => "test",
            Network::Regtest => "regtest",
        };
        f.write_str(s)
    }
}

impl FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Ok(Network::Main),
            "test" | "testnet" => Ok(Network::Test),
            "regtest" => Ok(Network::Regtest),
            other => anyhow::bail!("unknown network '{}'", other),
        }
    }
}
