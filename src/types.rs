//! Core chain types shared across the crate.

use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 256-bit digest. Equality and ordering are byte-wise.
pub type Hash = [u8; 32];

/// All-zero digest, used as the null reference.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Double SHA-256.
pub fn sha256d(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// RIPEMD160(SHA256(data)), the pubkey-hash digest.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

/// A 20-byte pay-to-pubkey-hash address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Derive an address from a serialized public key.
    pub fn from_pub_key(pub_key: &[u8]) -> Self {
        Address(hash160(pub_key))
    }

    pub fn pub_key_hash(&self) -> &[u8; 20] {
        &self.0
    }
}

/// Reference to one output of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash, index: u32) -> Self {
        OutPoint { hash, index }
    }

    /// The null reference used by coinbase inputs.
    pub fn null() -> Self {
        OutPoint { hash: ZERO_HASH, index: u32::MAX }
    }

    pub fn is_null(&self) -> bool {
        self.hash == ZERO_HASH && self.index == u32::MAX
    }
}

/// Transaction input: the unlocking script plus the output it spends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub prev_outpoint: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

/// Transaction output: a token quantity locked by a script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// A coinbase mints new tokens and carries the null outpoint as its
    /// single input.
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prev_outpoint.is_null()
    }

    /// Digest of the canonical transaction encoding.
    ///
    /// Signature hashing substitutes `script_sig` fields and recomputes this
    /// digest fresh; it is never cached across mutations.
    pub fn hash(&self) -> Hash {
        let mut buf = Vec::with_capacity(self.preimage_size());
        self.write_preimage(&mut buf);
        sha256d(&buf)
    }

    fn preimage_size(&self) -> usize {
        let vin: usize = self.vin.iter().map(|i| 48 + i.script_sig.len()).sum();
        let vout: usize = self.vout.iter().map(|o| 12 + o.script_pubkey.len()).sum();
        16 + vin + vout
    }

    fn write_preimage(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&(self.vin.len() as u32).to_le_bytes());
        for input in &self.vin {
            buf.extend_from_slice(&input.prev_outpoint.hash);
            buf.extend_from_slice(&input.prev_outpoint.index.to_le_bytes());
            buf.extend_from_slice(&(input.script_sig.len() as u32).to_le_bytes());
            buf.extend_from_slice(&input.script_sig);
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }
        buf.extend_from_slice(&(self.vout.len() as u32).to_le_bytes());
        for output in &self.vout {
            buf.extend_from_slice(&output.value.to_le_bytes());
            buf.extend_from_slice(&(output.script_pubkey.len() as u32).to_le_bytes());
            buf.extend_from_slice(&output.script_pubkey);
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block_hash: Hash,
    pub tx_root: Hash,
    pub time_stamp: i64,
    pub height: u32,
}

impl BlockHeader {
    /// Digest of the canonical header encoding.
    pub fn block_hash(&self) -> Hash {
        let mut buf = Vec::with_capacity(80);
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.extend_from_slice(&self.prev_block_hash);
        buf.extend_from_slice(&self.tx_root);
        buf.extend_from_slice(&self.time_stamp.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());
        sha256d(&buf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Transaction>,
}

impl Block {
    pub fn block_hash(&self) -> Hash {
        self.header.block_hash()
    }
}
