use crate::token::StateToken;
use bytes::{Buf, BufMut};
use commonware_codec::{
    varint::UInt, EncodeSize, Error, RangeCfg, Read, ReadExt, ReadRangeExt, Write,
};
use commonware_cryptography::{
    sha256::{Digest, Sha256},
    Digestible, Hasher,
};

/// Maximum number of transactions carried by one block request.
pub const MAX_BLOCK_TRANSACTIONS: usize = 1024;

/// Maximum encoded size of a single raw transaction.
pub const MAX_TRANSACTION_SIZE: usize = 1 << 20;

/// A proposed block handed to the finalize path.
///
/// The identity digest covers everything except the tentative state token:
/// two proposals with the same payload at different tentative tokens are
/// the same block, which is what the scheduler's abort comparison needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRequest {
    pub height: u64,
    pub time_ms: u64,
    /// Tentative volatile token the speculative run executes against.
    pub state_token: StateToken,
    /// Raw (undecoded) transactions; decoding happens inside finalize.
    pub transactions: Vec<Vec<u8>>,

    digest: Digest,
}

impl BlockRequest {
    fn compute_digest(height: u64, time_ms: u64, transactions: &[Vec<u8>]) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(&height.to_be_bytes());
        hasher.update(&time_ms.to_be_bytes());
        for transaction in transactions {
            hasher.update(&Sha256::hash(transaction));
        }
        hasher.finalize()
    }

    pub fn new(
        height: u64,
        time_ms: u64,
        state_token: StateToken,
        transactions: Vec<Vec<u8>>,
    ) -> Self {
        assert!(transactions.len() <= MAX_BLOCK_TRANSACTIONS);
        let digest = Self::compute_digest(height, time_ms, &transactions);
        Self {
            height,
            time_ms,
            state_token,
            transactions,
            digest,
        }
    }
}

impl Write for BlockRequest {
    fn write(&self, writer: &mut impl BufMut) {
        UInt(self.height).write(writer);
        UInt(self.time_ms).write(writer);
        self.state_token.write(writer);
        self.transactions.write(writer);
    }
}

impl Read for BlockRequest {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        let height = UInt::read(reader)?.into();
        let time_ms = UInt::read(reader)?.into();
        let state_token = StateToken::read(reader)?;
        let transactions = Vec::<Vec<u8>>::read_cfg(
            reader,
            &(
                RangeCfg::from(0..=MAX_BLOCK_TRANSACTIONS),
                (RangeCfg::from(0..=MAX_TRANSACTION_SIZE), ()),
            ),
        )?;

        // Pre-compute the digest
        let digest = Self::compute_digest(height, time_ms, &transactions);
        Ok(Self {
            height,
            time_ms,
            state_token,
            transactions,
            digest,
        })
    }
}

impl EncodeSize for BlockRequest {
    fn encode_size(&self) -> usize {
        UInt(self.height).encode_size()
            + UInt(self.time_ms).encode_size()
            + self.state_token.encode_size()
            + self.transactions.encode_size()
    }
}

impl Digestible for BlockRequest {
    type Digest = Digest;

    fn digest(&self) -> Digest {
        self.digest
    }
}

/// Outcome of one transaction inside a finalized block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxResult {
    /// Zero for success, else the terminal error code of the dispatch.
    pub code: u32,
    pub gas_used: u64,
    pub output: Vec<u8>,
}

impl Write for TxResult {
    fn write(&self, writer: &mut impl BufMut) {
        UInt(self.code).write(writer);
        UInt(self.gas_used).write(writer);
        self.output.write(writer);
    }
}

impl Read for TxResult {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            code: UInt::read(reader)?.into(),
            gas_used: UInt::read(reader)?.into(),
            output: Vec::<u8>::read_range(reader, 0..=MAX_TRANSACTION_SIZE)?,
        })
    }
}

impl EncodeSize for TxResult {
    fn encode_size(&self) -> usize {
        UInt(self.code).encode_size() + UInt(self.gas_used).encode_size() + self.output.encode_size()
    }
}

/// The response produced by a completed finalize run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockResponse {
    pub height: u64,
    pub results: Vec<TxResult>,
}

impl Write for BlockResponse {
    fn write(&self, writer: &mut impl BufMut) {
        UInt(self.height).write(writer);
        self.results.write(writer);
    }
}

impl Read for BlockResponse {
    type Cfg = ();

    fn read_cfg(reader: &mut impl Buf, _: &Self::Cfg) -> Result<Self, Error> {
        Ok(Self {
            height: UInt::read(reader)?.into(),
            results: Vec::<TxResult>::read_cfg(
                reader,
                &(RangeCfg::from(0..=MAX_BLOCK_TRANSACTIONS), ()),
            )?,
        })
    }
}

impl EncodeSize for BlockResponse {
    fn encode_size(&self) -> usize {
        UInt(self.height).encode_size() + self.results.encode_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_codec::{DecodeExt as _, Encode};

    fn volatile_token() -> StateToken {
        let mut bytes = [0u8; 32];
        bytes[0] = 0x80;
        StateToken::from_bytes(bytes)
    }

    #[test]
    fn test_digest_ignores_state_token() {
        let txs = vec![vec![1, 2, 3], vec![4, 5]];
        let a = BlockRequest::new(7, 1_000, volatile_token(), txs.clone());
        let b = BlockRequest::new(7, 1_000, StateToken::zero(), txs);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_digest_covers_payload() {
        let a = BlockRequest::new(7, 1_000, volatile_token(), vec![vec![1]]);
        let b = BlockRequest::new(7, 1_000, volatile_token(), vec![vec![2]]);
        let c = BlockRequest::new(8, 1_000, volatile_token(), vec![vec![1]]);
        assert_ne!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_block_request_codec() {
        let request = BlockRequest::new(42, 9_999, volatile_token(), vec![vec![0xaa; 16]]);
        let decoded = BlockRequest::decode(request.encode().as_ref()).unwrap();
        assert_eq!(request, decoded);
        assert_eq!(request.digest(), decoded.digest());
    }
}
