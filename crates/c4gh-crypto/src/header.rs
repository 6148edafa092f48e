//! Crypt4GH header: one AEAD-wrapped copy of the session key per recipient.
//!
//! ```text
//! header := "crypt4gh" | version u32 | packet_count u32 | packet*
//! packet := length u32 | method u32 | writer_pk[32] | nonce[12] | sealed payload
//! payload := type u32 (0 = data key, 1 = edit list) | body
//! ```
//!
//! All integers are little-endian. The packet key is HKDF-SHA256 over the
//! X25519 shared secret of writer and recipient, bound to both public keys.

use std::io::Read;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use c4gh_core::{C4ghError, C4ghResult};

use crate::keys::{KeyPair, PublicKeyBytes, SessionKey};
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

pub const MAGIC: &[u8; 8] = b"crypt4gh";
pub const VERSION: u32 = 1;

const PREAMBLE_SIZE: usize = 8 + 4 + 4;
const PACKET_PREFIX_SIZE: usize = 4 + 4 + KEY_SIZE + NONCE_SIZE;
const METHOD_X25519_CHACHA20_POLY1305: u32 = 0;
const DATA_METHOD_CHACHA20_POLY1305: u32 = 0;
const PACKET_DATA_KEY: u32 = 0;
const PACKET_EDIT_LIST: u32 = 1;
const PACKET_KDF_INFO: &[u8] = b"c4gh-packet-v1";

/// Upper bound on header packets, guards against absurd counts in hostile input
const MAX_PACKETS: u32 = 1024;
/// Upper bound on one packet, far above any data-key or sane edit-list packet
const MAX_PACKET_SIZE: usize = 1 << 20;

/// Byte-range selector over the plaintext stream: alternating skip and keep
/// lengths, starting with a skip. An odd-length list keeps everything after
/// its last skip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditList(Vec<u64>);

impl EditList {
    pub fn new(lengths: Vec<u64>) -> C4ghResult<Self> {
        if lengths.is_empty() {
            return Err(C4ghError::InvalidInput("edit list must not be empty".into()));
        }
        Ok(Self(lengths))
    }

    pub fn lengths(&self) -> &[u64] {
        &self.0
    }

    /// Stateful selector applying this list across segment boundaries.
    pub fn selector(&self) -> EditSelector {
        EditSelector {
            lengths: self.0.clone(),
            pos: 0,
            remaining: self.0.first().copied().unwrap_or(0),
        }
    }
}

/// Cursor over an [`EditList`], fed plaintext segments in stream order.
#[derive(Debug, Clone)]
pub struct EditSelector {
    lengths: Vec<u64>,
    pos: usize,
    remaining: u64,
}

impl EditSelector {
    /// Return the selected bytes of the next plaintext segment.
    pub fn select(&mut self, mut plaintext: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        while !plaintext.is_empty() {
            if self.pos >= self.lengths.len() {
                // Past the list: an odd count keeps the tail, an even one drops it.
                if self.lengths.len() % 2 == 1 {
                    out.extend_from_slice(plaintext);
                }
                break;
            }
            let keep = self.pos % 2 == 1;
            let take = (self.remaining.min(plaintext.len() as u64)) as usize;
            if keep {
                out.extend_from_slice(&plaintext[..take]);
            }
            plaintext = &plaintext[take..];
            self.remaining -= take as u64;
            if self.remaining == 0 {
                self.pos += 1;
                self.remaining = self.lengths.get(self.pos).copied().unwrap_or(0);
            }
        }
        out
    }

    /// True once no further plaintext can be selected.
    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.lengths.len() && self.lengths.len() % 2 == 0
    }
}

/// Result of opening a header with the local keypair.
#[derive(Debug)]
pub struct ParsedHeader {
    pub session_key: SessionKey,
    pub edit_list: Option<EditList>,
}

/// Build a header wrapping `session_key` for every recipient.
pub fn build(
    session_key: &SessionKey,
    sender: &KeyPair,
    recipients: &[PublicKeyBytes],
) -> C4ghResult<Vec<u8>> {
    build_with_edit_list(session_key, sender, recipients, None)
}

/// Build a header, optionally carrying an edit list for every recipient.
pub fn build_with_edit_list(
    session_key: &SessionKey,
    sender: &KeyPair,
    recipients: &[PublicKeyBytes],
    edit_list: Option<&EditList>,
) -> C4ghResult<Vec<u8>> {
    if recipients.is_empty() {
        return Err(C4ghError::NoRecipients);
    }

    let mut data_payload = Zeroizing::new(Vec::with_capacity(4 + 4 + KEY_SIZE));
    data_payload.extend_from_slice(&PACKET_DATA_KEY.to_le_bytes());
    data_payload.extend_from_slice(&DATA_METHOD_CHACHA20_POLY1305.to_le_bytes());
    data_payload.extend_from_slice(session_key.as_bytes());

    let edit_payload = edit_list.map(|list| {
        let mut p = Vec::with_capacity(8 + 8 * list.0.len());
        p.extend_from_slice(&PACKET_EDIT_LIST.to_le_bytes());
        p.extend_from_slice(&(list.0.len() as u32).to_le_bytes());
        for len in &list.0 {
            p.extend_from_slice(&len.to_le_bytes());
        }
        p
    });

    // a repeated key would give its holder two edit list packets
    let mut unique: Vec<&PublicKeyBytes> = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        if !unique.contains(&recipient) {
            unique.push(recipient);
        }
    }

    let per_recipient = if edit_payload.is_some() { 2 } else { 1 };
    let packet_count = unique.len() * per_recipient;
    let mut header = Vec::with_capacity(
        PREAMBLE_SIZE + packet_count * (PACKET_PREFIX_SIZE + data_payload.len() + TAG_SIZE),
    );
    header.extend_from_slice(MAGIC);
    header.extend_from_slice(&VERSION.to_le_bytes());
    header.extend_from_slice(&(packet_count as u32).to_le_bytes());

    let writer_pk = sender.public_bytes();
    for recipient in &unique {
        let key = packet_key(sender, &writer_pk, recipient, recipient)?;
        seal_packet(&mut header, &key, &writer_pk, &data_payload)?;
        if let Some(edit) = &edit_payload {
            seal_packet(&mut header, &key, &writer_pk, edit)?;
        }
    }

    tracing::debug!(
        recipients = unique.len(),
        packets = packet_count,
        bytes = header.len(),
        "built header"
    );
    Ok(header)
}

/// Open a header with the local keypair.
///
/// Packets sealed for other recipients are skipped; the first data packet
/// that verifies yields the session key.
pub fn parse(header: &[u8], local: &KeyPair) -> C4ghResult<ParsedHeader> {
    let packet_count = read_preamble(header)?;
    let local_pk = local.public_bytes();

    let mut session_key = None;
    let mut edit_list = None;
    let mut offset = PREAMBLE_SIZE;

    for _ in 0..packet_count {
        let len = read_u32(header, offset)? as usize;
        if len < PACKET_PREFIX_SIZE + TAG_SIZE || offset + len > header.len() {
            return Err(C4ghError::HeaderParse(format!(
                "packet at offset {offset} has invalid length {len}"
            )));
        }
        let packet = &header[offset..offset + len];
        offset += len;

        let Some(payload) = open_packet(packet, local, &local_pk)? else {
            continue;
        };

        match read_u32(&payload, 0)? {
            PACKET_DATA_KEY => {
                if session_key.is_none() {
                    session_key = Some(decode_data_key(&payload)?);
                }
            }
            PACKET_EDIT_LIST => {
                if edit_list.is_some() {
                    return Err(C4ghError::HeaderParse(
                        "more than one edit list for this recipient".into(),
                    ));
                }
                edit_list = Some(decode_edit_list(&payload)?);
            }
            other => {
                tracing::debug!(packet_type = other, "ignoring unknown header packet type");
            }
        }
    }

    if offset != header.len() {
        return Err(C4ghError::HeaderParse(format!(
            "{} trailing bytes after last packet",
            header.len() - offset
        )));
    }

    let session_key = session_key.ok_or_else(|| {
        C4ghError::HeaderParse("no header packet could be opened with the local key".into())
    })?;
    Ok(ParsedHeader {
        session_key,
        edit_list,
    })
}

/// Read exactly one header off the front of a stream, leaving the reader
/// positioned at the first ciphertext segment.
pub fn read_header<R: Read + ?Sized>(reader: &mut R) -> C4ghResult<Vec<u8>> {
    let mut header = vec![0u8; PREAMBLE_SIZE];
    reader.read_exact(&mut header).map_err(truncated)?;
    let packet_count = read_preamble(&header)?;

    for _ in 0..packet_count {
        let start = header.len();
        header.resize(start + 4, 0);
        reader.read_exact(&mut header[start..]).map_err(truncated)?;
        let len = read_u32(&header, start)? as usize;
        if !(PACKET_PREFIX_SIZE + TAG_SIZE..=MAX_PACKET_SIZE).contains(&len) {
            return Err(C4ghError::HeaderParse(format!("invalid packet length {len}")));
        }
        header.resize(start + len, 0);
        reader.read_exact(&mut header[start + 4..]).map_err(truncated)?;
    }
    Ok(header)
}

fn truncated(e: std::io::Error) -> C4ghError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        C4ghError::HeaderParse("header truncated".into())
    } else {
        C4ghError::Io(e)
    }
}

fn read_preamble(header: &[u8]) -> C4ghResult<u32> {
    if header.len() < PREAMBLE_SIZE || &header[..8] != MAGIC {
        return Err(C4ghError::HeaderParse("not a crypt4gh header".into()));
    }
    let version = read_u32(header, 8)?;
    if version != VERSION {
        return Err(C4ghError::HeaderParse(format!("unsupported version {version}")));
    }
    let count = read_u32(header, 12)?;
    if count == 0 || count > MAX_PACKETS {
        return Err(C4ghError::HeaderParse(format!("invalid packet count {count}")));
    }
    Ok(count)
}

fn read_u32(buf: &[u8], offset: usize) -> C4ghResult<u32> {
    buf.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| C4ghError::HeaderParse(format!("truncated at offset {offset}")))
}

/// Symmetric key for the packets between a writer and one recipient.
fn packet_key(
    own: &KeyPair,
    writer_pk: &PublicKeyBytes,
    recipient_pk: &PublicKeyBytes,
    peer: &PublicKeyBytes,
) -> C4ghResult<Zeroizing<[u8; KEY_SIZE]>> {
    let shared = own.diffie_hellman(peer);
    if !shared.was_contributory() {
        return Err(C4ghError::ReceiverKey("low-order public key".into()));
    }

    let mut info = Vec::with_capacity(PACKET_KDF_INFO.len() + 2 * KEY_SIZE);
    info.extend_from_slice(PACKET_KDF_INFO);
    info.extend_from_slice(recipient_pk);
    info.extend_from_slice(writer_pk);

    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
    hkdf.expand(&info, &mut okm[..])
        .map_err(|e| C4ghError::Other(anyhow::anyhow!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

fn seal_packet(
    out: &mut Vec<u8>,
    key: &[u8; KEY_SIZE],
    writer_pk: &PublicKeyBytes,
    payload: &[u8],
) -> C4ghResult<()> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    let sealed = ChaCha20Poly1305::new(key.into())
        .encrypt(Nonce::from_slice(&nonce), payload)
        .map_err(|e| C4ghError::Other(anyhow::anyhow!("header packet encryption failed: {e}")))?;

    let len = (PACKET_PREFIX_SIZE + sealed.len()) as u32;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&METHOD_X25519_CHACHA20_POLY1305.to_le_bytes());
    out.extend_from_slice(writer_pk);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(())
}

/// `Ok(None)` when the packet is not for us (or not a method we know).
fn open_packet(
    packet: &[u8],
    local: &KeyPair,
    local_pk: &PublicKeyBytes,
) -> C4ghResult<Option<Zeroizing<Vec<u8>>>> {
    if read_u32(packet, 4)? != METHOD_X25519_CHACHA20_POLY1305 {
        return Ok(None);
    }
    let mut writer_pk = [0u8; KEY_SIZE];
    writer_pk.copy_from_slice(&packet[8..8 + KEY_SIZE]);
    let nonce = &packet[8 + KEY_SIZE..PACKET_PREFIX_SIZE];
    let sealed = &packet[PACKET_PREFIX_SIZE..];

    let key = match packet_key(local, &writer_pk, local_pk, &writer_pk) {
        Ok(key) => key,
        Err(_) => return Ok(None),
    };
    let key: &[u8; KEY_SIZE] = &key;
    Ok(ChaCha20Poly1305::new(key.into())
        .decrypt(Nonce::from_slice(nonce), sealed)
        .ok()
        .map(Zeroizing::new))
}

fn decode_data_key(payload: &[u8]) -> C4ghResult<SessionKey> {
    if payload.len() != 8 + KEY_SIZE {
        return Err(C4ghError::HeaderParse(format!(
            "data key packet has {} bytes",
            payload.len()
        )));
    }
    let method = read_u32(payload, 4)?;
    if method != DATA_METHOD_CHACHA20_POLY1305 {
        return Err(C4ghError::HeaderParse(format!("unsupported data method {method}")));
    }
    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&payload[8..]);
    let key = SessionKey::from_bytes(bytes);
    bytes.zeroize();
    Ok(key)
}

fn decode_edit_list(payload: &[u8]) -> C4ghResult<EditList> {
    let count = read_u32(payload, 4)? as usize;
    let expected = count.checked_mul(8).and_then(|n| n.checked_add(8));
    if expected != Some(payload.len()) {
        return Err(C4ghError::HeaderParse(format!(
            "edit list declares {count} entries in {} bytes",
            payload.len()
        )));
    }
    let lengths = payload[8..]
        .chunks_exact(8)
        .map(|b| {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(b);
            u64::from_le_bytes(arr)
        })
        .collect();
    EditList::new(lengths).map_err(|e| C4ghError::HeaderParse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipients(n: usize) -> Vec<KeyPair> {
        (0..n).map(|_| KeyPair::generate()).collect()
    }

    #[test]
    fn every_recipient_recovers_the_session_key() {
        let sender = KeyPair::generate();
        let readers = recipients(3);
        let pks: Vec<_> = readers.iter().map(KeyPair::public_bytes).collect();
        let key = SessionKey::generate();

        let header = build(&key, &sender, &pks).unwrap();
        for reader in &readers {
            let parsed = parse(&header, reader).unwrap();
            assert_eq!(parsed.session_key.as_bytes(), key.as_bytes());
            assert!(parsed.edit_list.is_none());
        }
    }

    #[test]
    fn unrelated_key_fails_with_header_parse_error() {
        let sender = KeyPair::generate();
        let pks: Vec<_> = recipients(2).iter().map(KeyPair::public_bytes).collect();
        let header = build(&SessionKey::generate(), &sender, &pks).unwrap();

        let stranger = KeyPair::generate();
        assert!(matches!(
            parse(&header, &stranger),
            Err(C4ghError::HeaderParse(_))
        ));
    }

    #[test]
    fn header_size_is_fixed_per_recipient() {
        let sender = KeyPair::generate();
        let pks: Vec<_> = recipients(2).iter().map(KeyPair::public_bytes).collect();
        let header = build(&SessionKey::generate(), &sender, &pks).unwrap();
        // preamble + 2 * (prefix + type + method + key + tag)
        assert_eq!(header.len(), 16 + 2 * (PACKET_PREFIX_SIZE + 8 + KEY_SIZE + TAG_SIZE));
    }

    #[test]
    fn no_recipients_is_rejected() {
        let sender = KeyPair::generate();
        assert!(matches!(
            build(&SessionKey::generate(), &sender, &[]),
            Err(C4ghError::NoRecipients)
        ));
    }

    #[test]
    fn edit_list_travels_with_the_key() {
        let sender = KeyPair::generate();
        let reader = KeyPair::generate();
        let key = SessionKey::generate();
        let list = EditList::new(vec![10, 20, 5]).unwrap();

        let header =
            build_with_edit_list(&key, &sender, &[reader.public_bytes()], Some(&list)).unwrap();
        let parsed = parse(&header, &reader).unwrap();
        assert_eq!(parsed.edit_list, Some(list));
    }

    #[test]
    fn repeated_recipient_gets_one_set_of_packets() {
        let sender = KeyPair::generate();
        let reader = KeyPair::generate();
        let list = EditList::new(vec![4, 8]).unwrap();
        let pks = [reader.public_bytes(), reader.public_bytes()];

        let header =
            build_with_edit_list(&SessionKey::generate(), &sender, &pks, Some(&list)).unwrap();
        assert_eq!(read_u32(&header, 12).unwrap(), 2);
        let parsed = parse(&header, &reader).unwrap();
        assert_eq!(parsed.edit_list, Some(list));
    }

    #[test]
    fn edit_list_count_overflow_is_header_parse_error() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&PACKET_EDIT_LIST.to_le_bytes());
        payload.extend_from_slice(&u32::MAX.to_le_bytes());
        payload.extend_from_slice(&7u64.to_le_bytes());
        assert!(matches!(
            decode_edit_list(&payload),
            Err(C4ghError::HeaderParse(_))
        ));
    }

    #[test]
    fn tampered_packet_is_skipped_then_fails() {
        let sender = KeyPair::generate();
        let reader = KeyPair::generate();
        let mut header =
            build(&SessionKey::generate(), &sender, &[reader.public_bytes()]).unwrap();
        let last = header.len() - 1;
        header[last] ^= 0x01;
        assert!(matches!(parse(&header, &reader), Err(C4ghError::HeaderParse(_))));
    }

    #[test]
    fn garbage_is_not_a_header() {
        let reader = KeyPair::generate();
        assert!(matches!(
            parse(b"definitely not a header", &reader),
            Err(C4ghError::HeaderParse(_))
        ));
    }

    #[test]
    fn read_header_stops_at_first_segment() {
        let sender = KeyPair::generate();
        let reader = KeyPair::generate();
        let header = build(&SessionKey::generate(), &sender, &[reader.public_bytes()]).unwrap();

        let mut stream = header.clone();
        stream.extend_from_slice(b"SEGMENT-BYTES");
        let mut cursor = std::io::Cursor::new(stream);

        let read = read_header(&mut cursor).unwrap();
        assert_eq!(read, header);
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"SEGMENT-BYTES");
    }

    #[test]
    fn read_header_reports_truncation() {
        let sender = KeyPair::generate();
        let header = build(&SessionKey::generate(), &sender, &[sender.public_bytes()]).unwrap();
        let mut cursor = std::io::Cursor::new(&header[..header.len() - 3]);
        assert!(matches!(
            read_header(&mut cursor),
            Err(C4ghError::HeaderParse(_))
        ));
    }

    #[test]
    fn selector_applies_skip_keep_across_segments() {
        // skip 3, keep 4, skip 2, keep rest
        let list = EditList::new(vec![3, 4, 2]).unwrap();
        let mut sel = list.selector();
        let mut out = sel.select(b"abcde");
        out.extend(sel.select(b"fghij"));
        out.extend(sel.select(b"klm"));
        assert_eq!(out, b"defgjklm");
    }

    #[test]
    fn selector_even_list_drops_tail() {
        let list = EditList::new(vec![1, 2]).unwrap();
        let mut sel = list.selector();
        assert_eq!(sel.select(b"abcdef"), b"bc");
        assert!(sel.is_exhausted());
        assert!(sel.select(b"more").is_empty());
    }
}
