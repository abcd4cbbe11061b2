/// Composite sortable binary keys.
///
/// Every index in a physical store lives in one ordered byte map, separated
/// by a single keyspace prefix byte. All composite keys are designed so that
/// plain byte-wise ordering equals the logical ordering the engine needs:
///
/// - times are encoded as 12 fixed bytes (sign-biased big-endian seconds,
///   then big-endian nanos), so byte order equals chronological order;
/// - series ids use a length-prefixed big-endian varint, so shorter ids sort
///   before longer ones and byte order equals numeric order;
/// - an observation's key is the varint series id followed by the encoded
///   phenomenon time, which is exactly the public composite key contract.
///
/// Decoding is strict: malformed bytes decode to `None`, never a panic.
use crate::time::{NANOS_PER_SEC, Time};
use crate::types::{DataStreamId, FoiId, SeriesId};

/// Keyspace prefixes. One ordered map per physical store holds every index;
/// the first key byte selects the index.
pub(crate) mod ks {
    /// Series grouping key ordered (datastream, foi, result-time bucket).
    pub const SERIES_BY_DS: u8 = 0x01;
    /// Series grouping key ordered (foi, datastream, result-time bucket).
    pub const SERIES_BY_FOI: u8 = 0x02;
    /// Series id -> series info reverse mapping.
    pub const SERIES_INFO: u8 = 0x03;
    /// Observations keyed by (series id varint, phenomenon time).
    pub const OBS: u8 = 0x04;

    /// Datastream records keyed by local id.
    pub const DS_RECORD: u8 = 0x10;
    /// Datastream revision index keyed (system, output name, inverted start).
    pub const DS_REVISIONS: u8 = 0x11;
    /// Datastream full-text postings.
    pub const DS_TEXT: u8 = 0x12;

    /// Command stream records keyed by local id.
    pub const CS_RECORD: u8 = 0x20;
    /// Command stream revision index.
    pub const CS_REVISIONS: u8 = 0x21;
    /// Command stream full-text postings.
    pub const CS_TEXT: u8 = 0x22;

    /// System records keyed by local id.
    pub const SYS_RECORD: u8 = 0x30;
    /// System revision index keyed (uid, inverted start).
    pub const SYS_REVISIONS: u8 = 0x31;
    /// System full-text postings.
    pub const SYS_TEXT: u8 = 0x32;

    /// Feature-of-interest records keyed by local id.
    pub const FOI_RECORD: u8 = 0x40;
    /// Feature-of-interest revision index keyed (uid, inverted start).
    pub const FOI_REVISIONS: u8 = 0x41;
    /// Feature-of-interest full-text postings.
    pub const FOI_TEXT: u8 = 0x42;
}

/// Encoded time width in bytes.
pub const TIME_LEN: usize = 12;

/// Append the sortable 12-byte encoding of `t`.
pub fn push_time(buf: &mut Vec<u8>, t: Time) {
    let biased = (t.seconds as u64) ^ (1 << 63);
    buf.extend_from_slice(&biased.to_be_bytes());
    buf.extend_from_slice(&t.nanos.to_be_bytes());
}

/// Append the byte-complemented encoding of `t`, which sorts in reverse
/// chronological order. Used by revision indexes so "latest" is the first
/// entry of a range probe.
pub fn push_time_inverted(buf: &mut Vec<u8>, t: Time) {
    let start = buf.len();
    push_time(buf, t);
    for b in &mut buf[start..] {
        *b = !*b;
    }
}

/// Decode 12 sortable time bytes. Rejects nanos outside `0..1e9`.
pub fn decode_time(bytes: &[u8]) -> Option<Time> {
    if bytes.len() != TIME_LEN {
        return None;
    }
    let biased = u64::from_be_bytes(bytes[..8].try_into().ok()?);
    let nanos = u32::from_be_bytes(bytes[8..].try_into().ok()?);
    if nanos >= NANOS_PER_SEC {
        return None;
    }
    Some(Time {
        seconds: (biased ^ (1 << 63)) as i64,
        nanos,
    })
}

/// Append the length-prefixed big-endian varint of `v`: one count byte in
/// `1..=8`, then that many bytes, minimal. Sorts numerically.
pub fn push_varint(buf: &mut Vec<u8>, v: u64) {
    let bytes = v.to_be_bytes();
    let skip = (v.leading_zeros() as usize / 8).min(7);
    let len = 8 - skip;
    buf.push(len as u8);
    buf.extend_from_slice(&bytes[skip..]);
}

/// Decode a length-prefixed varint, returning the value and remaining bytes.
/// Rejects non-minimal encodings.
pub fn decode_varint(bytes: &[u8]) -> Option<(u64, &[u8])> {
    let (&len, rest) = bytes.split_first()?;
    let len = len as usize;
    if !(1..=8).contains(&len) || rest.len() < len {
        return None;
    }
    let (payload, rest) = rest.split_at(len);
    if len > 1 && payload[0] == 0 {
        return None; // non-minimal
    }
    let mut v = 0u64;
    for &b in payload {
        v = (v << 8) | b as u64;
    }
    Some((v, rest))
}

/// An observation's identity: `(series id, phenomenon time)`.
///
/// [`ObsKey::encode`] produces the packed public composite key (interpreted
/// by callers as an arbitrary-precision big-endian integer);
/// [`ObsKey::decode`] is the exact inverse and returns `None` for anything
/// malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObsKey {
    /// The owning series.
    pub series: SeriesId,
    /// The observation's phenomenon time.
    pub phenomenon_time: Time,
}

impl ObsKey {
    /// Create a key.
    pub fn new(series: SeriesId, phenomenon_time: Time) -> Self {
        Self {
            series,
            phenomenon_time,
        }
    }

    /// Encode to the packed public form (13 to 21 bytes).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(21);
        push_varint(&mut buf, self.series.0);
        push_time(&mut buf, self.phenomenon_time);
        buf
    }

    /// Decode the packed public form. Trailing bytes, non-minimal varints
    /// and invalid time fields are all rejected with `None`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (series, rest) = decode_varint(bytes)?;
        let phenomenon_time = decode_time(rest)?;
        Some(Self {
            series: SeriesId(series),
            phenomenon_time,
        })
    }
}

impl std::fmt::Display for ObsKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.encode() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Storage key for an observation: keyspace prefix plus the packed key.
pub(crate) fn obs_storage_key(key: &ObsKey) -> Vec<u8> {
    let mut buf = vec![ks::OBS];
    buf.extend_from_slice(&key.encode());
    buf
}

/// Series grouping key in (datastream, foi, bucket) order.
pub(crate) fn series_by_ds_key(ds: DataStreamId, foi: FoiId, bucket: Time) -> Vec<u8> {
    let mut buf = vec![ks::SERIES_BY_DS];
    buf.extend_from_slice(&ds.0.to_be_bytes());
    buf.extend_from_slice(&foi.0.to_be_bytes());
    push_time(&mut buf, bucket);
    buf
}

/// Series grouping key in (foi, datastream, bucket) order.
pub(crate) fn series_by_foi_key(foi: FoiId, ds: DataStreamId, bucket: Time) -> Vec<u8> {
    let mut buf = vec![ks::SERIES_BY_FOI];
    buf.extend_from_slice(&foi.0.to_be_bytes());
    buf.extend_from_slice(&ds.0.to_be_bytes());
    push_time(&mut buf, bucket);
    buf
}

/// Series info key.
pub(crate) fn series_info_key(series: SeriesId) -> Vec<u8> {
    let mut buf = vec![ks::SERIES_INFO];
    buf.extend_from_slice(&series.0.to_be_bytes());
    buf
}

/// Record key for a metadata keyspace: prefix plus big-endian local id.
pub(crate) fn record_key(keyspace: u8, id: u64) -> Vec<u8> {
    let mut buf = vec![keyspace];
    buf.extend_from_slice(&id.to_be_bytes());
    buf
}

/// Revision index key: prefix, producer key bytes, inverted valid-start.
/// Within one producer the first entry is the latest revision.
pub(crate) fn revision_key(keyspace: u8, producer: &[u8], valid_start: Time) -> Vec<u8> {
    let mut buf = vec![keyspace];
    buf.extend_from_slice(producer);
    push_time_inverted(&mut buf, valid_start);
    buf
}

/// Full-text posting key: prefix, token, NUL, big-endian local id.
pub(crate) fn posting_key(keyspace: u8, token: &str, id: u64) -> Vec<u8> {
    let mut buf = vec![keyspace];
    buf.extend_from_slice(token.as_bytes());
    buf.push(0);
    buf.extend_from_slice(&id.to_be_bytes());
    buf
}

/// Number of low bits of a public id that carry the database number.
pub const DB_BITS: u32 = 8;

/// Largest local id that can be packed into a public id.
pub const MAX_LOCAL_ID: u64 = (1 << (64 - DB_BITS)) - 1;

/// Pack a `(database number, local id)` pair into one public id.
/// Returns `None` when the local id is too large to pack.
pub fn pack_public_id(db: u8, local: u64) -> Option<u64> {
    if local > MAX_LOCAL_ID {
        return None;
    }
    Some((local << DB_BITS) | db as u64)
}

/// Split a public id back into its `(database number, local id)` pair.
/// Total inverse of [`pack_public_id`]: distinct pairs never collide.
pub fn split_public_id(public: u64) -> (u8, u64) {
    ((public & 0xFF) as u8, public >> DB_BITS)
}
