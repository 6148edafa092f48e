//! Decryption side: header once, then segments strictly in file order.

use std::io::{Read, Write};

use tracing::{debug, warn};
use zeroize::Zeroizing;

use c4gh_core::{C4ghError, C4ghResult, CIPHER_SEGMENT_SIZE};
use c4gh_crypto::{decrypt_segment, read_header, EditList, EditSelector, SessionKey};

use crate::chunk::Chunk;
use crate::fs::read_up_to;
use crate::session::EncryptSession;
use crate::upload::StreamStats;

/// Segment-by-segment decryptor for one stream.
///
/// After the first authentication failure every further segment is refused:
/// a stream that failed once is never trusted again.
pub struct DecryptStream<'k> {
    key: &'k SessionKey,
    selector: Option<EditSelector>,
    index: u64,
    poisoned: bool,
}

impl<'k> DecryptStream<'k> {
    pub fn new(key: &'k SessionKey, edit_list: Option<&EditList>) -> Self {
        Self {
            key,
            selector: edit_list.map(EditList::selector),
            index: 0,
            poisoned: false,
        }
    }

    /// Decrypt the next ciphertext segment and apply the edit list.
    pub fn push_segment(&mut self, ciphertext: &[u8]) -> C4ghResult<Chunk> {
        if self.poisoned {
            return Err(C4ghError::Authentication(format!(
                "stream halted after segment {} failed",
                self.index
            )));
        }

        let plaintext = match decrypt_segment(self.key, ciphertext) {
            Ok(p) => Zeroizing::new(p),
            Err(e) => {
                self.poisoned = true;
                warn!(segment = self.index, "segment failed authentication, halting stream");
                return Err(e);
            }
        };
        self.index += 1;

        let selected = match self.selector.as_mut() {
            Some(selector) => selector.select(&plaintext),
            None => plaintext.to_vec(),
        };
        Ok(Chunk::from_vec(selected))
    }

    /// Segments decrypted so far.
    pub fn segments(&self) -> u64 {
        self.index
    }

    /// True once the edit list excludes everything that could follow.
    pub fn is_exhausted(&self) -> bool {
        self.selector.as_ref().is_some_and(EditSelector::is_exhausted)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

/// Decrypt a whole `header || segments` stream into `writer`.
///
/// The session must not have a session key yet; it is taken from the header.
pub fn decrypt_stream<R, W>(
    session: &mut EncryptSession,
    reader: &mut R,
    writer: &mut W,
) -> C4ghResult<StreamStats>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let header = read_header(reader)?;
    let edit_list = session.open_header(&header)?;
    let mut stream = DecryptStream::new(session.session_key()?, edit_list.as_ref());

    let mut stats = StreamStats {
        ciphertext_bytes: header.len() as u64,
        ..StreamStats::default()
    };
    let mut buf = vec![0u8; CIPHER_SEGMENT_SIZE];

    loop {
        let n = read_up_to(reader, &mut buf)?;
        if n == 0 {
            break;
        }
        let out = stream.push_segment(&buf[..n])?;
        writer.write_all(out.content())?;
        stats.segments += 1;
        stats.ciphertext_bytes += n as u64;
        stats.plaintext_bytes += out.len() as u64;
        if n < CIPHER_SEGMENT_SIZE || stream.is_exhausted() {
            break;
        }
    }

    writer.flush()?;
    debug!(segments = stats.segments, bytes = stats.plaintext_bytes, "stream decrypted");
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use c4gh_crypto::{encrypt_segment, KeyPair};
    use proptest::prelude::*;

    /// Straight-line selection over the whole plaintext.
    fn select_whole(data: &[u8], lengths: &[u64]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut pos = 0usize;
        for (i, len) in lengths.iter().enumerate() {
            let end = (pos + *len as usize).min(data.len());
            if i % 2 == 1 {
                out.extend_from_slice(&data[pos..end]);
            }
            pos = end;
        }
        if lengths.len() % 2 == 1 {
            out.extend_from_slice(&data[pos..]);
        }
        out
    }

    #[test]
    fn test_poisoned_after_tamper() {
        let key = SessionKey::generate();
        let good = encrypt_segment(&key, b"first").unwrap();
        let mut bad = encrypt_segment(&key, b"second").unwrap();
        bad[20] ^= 0x01;

        let mut stream = DecryptStream::new(&key, None);
        assert_eq!(stream.push_segment(&good).unwrap().content(), b"first");
        assert!(matches!(
            stream.push_segment(&bad),
            Err(C4ghError::Authentication(_))
        ));
        assert!(stream.is_poisoned());
        // Even a valid segment is refused now
        assert!(stream.push_segment(&good).is_err());
        assert_eq!(stream.segments(), 1);
    }

    #[test]
    fn test_edit_list_spans_segments() {
        let key = SessionKey::generate();
        let list = EditList::new(vec![3, 4]).unwrap();
        let mut stream = DecryptStream::new(&key, Some(&list));

        let a = stream.push_segment(&encrypt_segment(&key, b"abcde").unwrap()).unwrap();
        let b = stream.push_segment(&encrypt_segment(&key, b"fghij").unwrap()).unwrap();
        assert_eq!(a.content(), b"de");
        assert_eq!(b.content(), b"fg");
        assert!(stream.is_exhausted());
    }

    #[test]
    fn test_decrypt_stream_rejects_foreign_header() {
        let mut writer = EncryptSession::with_keypair(KeyPair::generate());
        writer.add_recipient(KeyPair::generate().public_bytes());
        writer.create_session_key().unwrap();
        let header = writer.build_header().unwrap();

        let mut outsider = EncryptSession::with_keypair(KeyPair::generate());
        let mut out = Vec::new();
        let err = decrypt_stream(&mut outsider, &mut header.as_slice(), &mut out).unwrap_err();
        assert!(matches!(err, C4ghError::HeaderParse(_)));
        assert!(out.is_empty());
    }

    #[test]
    fn test_truncated_header_is_header_parse_error() {
        let mut session = EncryptSession::with_keypair(KeyPair::generate());
        let mut out = Vec::new();
        let err = decrypt_stream(&mut session, &mut &b"crypt4"[..], &mut out).unwrap_err();
        assert!(matches!(err, C4ghError::HeaderParse(_)));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn segmented_selection_matches_whole_selection(
            data in proptest::collection::vec(any::<u8>(), 1..4000),
            lengths in proptest::collection::vec(0u64..1500, 1..6),
            segment in 1usize..700,
        ) {
            let key = SessionKey::generate();
            let list = EditList::new(lengths.clone()).unwrap();
            let mut stream = DecryptStream::new(&key, Some(&list));

            let mut out = Vec::new();
            for piece in data.chunks(segment) {
                let ct = encrypt_segment(&key, piece).unwrap();
                out.extend_from_slice(stream.push_segment(&ct).unwrap().content());
            }
            prop_assert_eq!(out, select_whole(&data, &lengths));
        }
    }
}
