/*
 * ============================================================================
 * CRATE: MERKLE-PUZZLES (Rust Core) v0.1
 * DESCRIPTION: Merkle's Puzzles key agreement over AES-128-CBC
 * PARAMS: N=1024 puzzles, 256-key weak keyspace, 39-byte plaintext, MIT
 * NOTE: 100% Safe Rust, deterministic under a caller-supplied RNG
 * ============================================================================
 */

use std::fmt;

use aes::Aes128;
use block_modes::block_padding::{NoPadding, Pkcs7};
use block_modes::{BlockMode, Cbc};
use rand::Rng;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/* === [1. Constants] === */

/// Default number of puzzles Alice pre-generates.
pub const DEFAULT_PUZZLE_COUNT: usize = 1024;
/// ASCII hex digits in a puzzle identifier.
pub const ID_LEN: usize = 16;
/// ASCII hex digits in a shared secret.
pub const SECRET_LEN: usize = 16;
/// AES-128 key length in bytes.
pub const KEY_LEN: usize = 16;
/// AES block length in bytes.
pub const BLOCK_LEN: usize = 16;
/// Number of reachable weak keys: two free hex digits.
pub const WEAK_KEYSPACE: usize = 256;
/// Marker prefix every puzzle plaintext starts with (word + separator).
pub const MARKER: &[u8] = b"Puzzle ";
/// Puzzle plaintext length: marker, identifier, secret.
pub const PLAINTEXT_LEN: usize = MARKER.len() + ID_LEN + SECRET_LEN;
/// Puzzle ciphertext length: plaintext PKCS#7-padded to whole blocks.
pub const CIPHERTEXT_LEN: usize = (PLAINTEXT_LEN / BLOCK_LEN + 1) * BLOCK_LEN;

/// Fixed, publicly known IV. The 16 ASCII characters are the IV bytes,
/// matching the demo protocol this crate reimplements; key material is
/// handled the same way (see `WeakKey`).
pub const FIXED_IV: [u8; BLOCK_LEN] = *b"e0e0e0e0f1f1f1f1";

const HEX_ALPHABET: &[u8; 16] = b"0123456789abcdef";

type Aes128Cbc = Cbc<Aes128, Pkcs7>;
type Aes128CbcRaw = Cbc<Aes128, NoPadding>;

/* === [2. Errors] === */

/// Failures of the block-cipher layer. Both indicate a programming or
/// environment defect, not a recoverable runtime condition.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("key or iv has the wrong length for AES-128-CBC")]
    InvalidKeyIv,
    #[error("block cipher operation failed")]
    Op,
}

/// Logical failures of the puzzle pipeline.
#[derive(Debug, Error)]
pub enum PuzzleError {
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("puzzle index {index} out of range for a store of {capacity}")]
    IndexOutOfRange { index: usize, capacity: usize },
    #[error("no candidate key produced the marker after {attempts} attempts")]
    SolveFailed { attempts: usize },
    #[error("identifier not present in the store")]
    NotFound,
}

/* === [3. Data Structures] === */

/// Puzzle identifier `X`: public once a puzzle is solved, used to look up
/// the matching shared secret. 16 independent uniform hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroize)]
pub struct PuzzleId {
    pub digits: [u8; ID_LEN],
}

impl PuzzleId {
    pub fn random(rng: &mut impl Rng) -> Self {
        let mut digits = [0u8; ID_LEN];
        for d in digits.iter_mut() {
            *d = HEX_ALPHABET[rng.gen_range(0..HEX_ALPHABET.len())];
        }
        Self { digits }
    }
}

impl fmt::Display for PuzzleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.digits))
    }
}

/// Shared secret `K`: the value both parties converge on.
#[derive(Debug, Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret {
    pub digits: [u8; SECRET_LEN],
}

impl SharedSecret {
    pub fn random(rng: &mut impl Rng) -> Self {
        let mut digits = [0u8; SECRET_LEN];
        for d in digits.iter_mut() {
            *d = HEX_ALPHABET[rng.gen_range(0..HEX_ALPHABET.len())];
        }
        Self { digits }
    }
}

impl fmt::Display for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.digits))
    }
}

/// Weak encryption key: fourteen ASCII zeros followed by the two hex
/// digits of one random byte, so only 256 keys are reachable. The ASCII
/// characters themselves are the AES key material, not their decoded
/// value; the brute-force asymmetry lives entirely in the two free
/// digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Zeroize)]
pub struct WeakKey {
    pub key: [u8; KEY_LEN],
}

impl WeakKey {
    /// Key for one of the 256 reachable suffixes.
    pub fn from_suffix(suffix: u8) -> Self {
        let mut key = [b'0'; KEY_LEN];
        key[KEY_LEN - 2] = HEX_ALPHABET[(suffix >> 4) as usize];
        key[KEY_LEN - 1] = HEX_ALPHABET[(suffix & 0x0f) as usize];
        Self { key }
    }

    pub fn random(rng: &mut impl Rng) -> Self {
        Self::from_suffix(rng.gen())
    }
}

impl fmt::Display for WeakKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.key))
    }
}

/// One generated puzzle: everything Alice keeps on her side of the table.
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct PuzzleRecord {
    pub index: usize,
    pub id: PuzzleId,
    pub secret: SharedSecret,
    pub plaintext: [u8; PLAINTEXT_LEN],
    pub weak_key: WeakKey,
    pub ciphertext: [u8; CIPHERTEXT_LEN],
}

/// Alice's ordered table of puzzles. Filled once during generation,
/// read-only afterwards; indices run 0..N-1 with no gaps.
#[derive(Debug)]
pub struct PuzzleStore {
    records: Vec<PuzzleRecord>,
    capacity: usize,
}

impl PuzzleStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { records: Vec::with_capacity(capacity), capacity }
    }

    /// Insert the record for the next sequential slot.
    ///
    /// # Errors
    /// `IndexOutOfRange` when the record's index is not the next free slot
    /// or the store is already full. Both are caller contract violations.
    pub fn insert(&mut self, record: PuzzleRecord) -> Result<(), PuzzleError> {
        if record.index >= self.capacity || record.index != self.records.len() {
            return Err(PuzzleError::IndexOutOfRange {
                index: record.index,
                capacity: self.capacity,
            });
        }
        self.records.push(record);
        Ok(())
    }

    /// Generate and store `capacity` puzzles in one pass.
    pub fn generate_all(capacity: usize, rng: &mut impl Rng) -> Result<Self, PuzzleError> {
        let mut store = Self::with_capacity(capacity);
        for index in 0..capacity {
            store.insert(generate(index, rng)?)?;
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, index: usize) -> Option<&PuzzleRecord> {
        self.records.get(index)
    }

    pub fn records(&self) -> &[PuzzleRecord] {
        &self.records
    }
}

/* === [4. Cipher Engine] === */

/// Encrypt under AES-128-CBC with PKCS#7 padding.
///
/// Deterministic for identical inputs; every call returns its own owned
/// buffer.
///
/// # Errors
/// `InvalidKeyIv` when the key or IV length does not fit AES-128-CBC.
pub fn encrypt(plaintext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = Aes128Cbc::new_from_slices(key, iv).map_err(|_| CipherError::InvalidKeyIv)?;
    Ok(cipher.encrypt_vec(plaintext))
}

/// Decrypt under AES-128-CBC.
///
/// Padding is stripped only when it is well formed. A wrong-key attempt
/// produces garbage whose tail rarely forms valid PKCS#7, and the solver
/// must be able to inspect that garbage, so the full decrypted buffer is
/// returned instead of an error.
///
/// # Errors
/// `InvalidKeyIv` on bad key/IV lengths, `Op` when the ciphertext is not
/// a whole number of blocks.
pub fn decrypt(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = Aes128CbcRaw::new_from_slices(key, iv).map_err(|_| CipherError::InvalidKeyIv)?;
    let mut buf = cipher.decrypt_vec(ciphertext).map_err(|_| CipherError::Op)?;
    if let Some(stripped) = pkcs7_len(&buf) {
        buf.truncate(stripped);
    }
    Ok(buf)
}

/// Length of `buf` once well-formed PKCS#7 padding is removed.
fn pkcs7_len(buf: &[u8]) -> Option<usize> {
    let pad = *buf.last()? as usize;
    if pad == 0 || pad > BLOCK_LEN || pad > buf.len() {
        return None;
    }
    let tail = &buf[buf.len() - pad..];
    tail.iter().all(|&b| b as usize == pad).then(|| buf.len() - pad)
}

/* === [5. Puzzle Generator] === */

/// Generate the puzzle for one store slot.
///
/// # Returns
/// The full `PuzzleRecord`: identifier, secret, plaintext, weak key, and
/// the ciphertext of `"Puzzle " || X || K` under the weak key and the
/// fixed public IV.
pub fn generate(index: usize, rng: &mut impl Rng) -> Result<PuzzleRecord, PuzzleError> {
    // 1. Draw the identifier, the secret, and the weak key independently
    let id = PuzzleId::random(rng);
    let secret = SharedSecret::random(rng);
    let weak_key = WeakKey::random(rng);

    // 2. Assemble the 39-byte plaintext
    let mut plaintext = [0u8; PLAINTEXT_LEN];
    plaintext[..MARKER.len()].copy_from_slice(MARKER);
    plaintext[MARKER.len()..MARKER.len() + ID_LEN].copy_from_slice(&id.digits);
    plaintext[MARKER.len() + ID_LEN..].copy_from_slice(&secret.digits);

    // 3. Encrypt under the weak key; 39 bytes always pad to three blocks
    let encrypted = encrypt(&plaintext, &weak_key.key, &FIXED_IV)?;
    let mut ciphertext = [0u8; CIPHERTEXT_LEN];
    ciphertext.copy_from_slice(&encrypted);

    tracing::info!(index, key = %weak_key, "generated puzzle");

    Ok(PuzzleRecord { index, id, secret, plaintext, weak_key, ciphertext })
}

/* === [6. Brute-Force Solver] === */

/// Outcome of a successful brute-force pass.
#[derive(Debug, Clone)]
pub struct Solution {
    /// Identifier recovered from the decrypted plaintext.
    pub id: PuzzleId,
    /// The candidate key that revealed the marker.
    pub key: WeakKey,
    /// Decrypt attempts spent, at most `WEAK_KEYSPACE`.
    pub attempts: usize,
}

/// Brute-force one puzzle chosen uniformly at random from the store.
///
/// # Errors
/// `SolveFailed` when no candidate key reveals the marker.
pub fn solve(store: &PuzzleStore, rng: &mut impl Rng) -> Result<Solution, PuzzleError> {
    if store.is_empty() {
        return Err(PuzzleError::SolveFailed { attempts: 0 });
    }
    let choice = rng.gen_range(0..store.len());
    tracing::debug!(choice, "picked puzzle to brute-force");
    solve_ciphertext(&store.records[choice].ciphertext)
}

/// Exhaust the 256-key weak keyspace against a single ciphertext.
///
/// Candidate suffixes are tried in increasing order starting at zero and
/// the sweep is bounded: one full pass, then `SolveFailed`.
pub fn solve_ciphertext(ciphertext: &[u8; CIPHERTEXT_LEN]) -> Result<Solution, PuzzleError> {
    for (attempt, suffix) in (0..=u8::MAX).enumerate() {
        let key = WeakKey::from_suffix(suffix);
        tracing::trace!(key = %key, "trying candidate key");
        let plain = decrypt(ciphertext, &key.key, &FIXED_IV)?;
        if let Some(id) = extract_id(&plain) {
            let attempts = attempt + 1;
            tracing::info!(key = %key, attempts, "weak key recovered");
            return Ok(Solution { id, key, attempts });
        }
    }
    Err(PuzzleError::SolveFailed { attempts: WEAK_KEYSPACE })
}

/// Find the marker in a decrypted buffer and read the identifier digits
/// that immediately follow it.
fn extract_id(plain: &[u8]) -> Option<PuzzleId> {
    let at = plain.windows(MARKER.len()).position(|w| w == MARKER)?;
    let start = at + MARKER.len();
    let digits = plain.get(start..start + ID_LEN)?.try_into().ok()?;
    Some(PuzzleId { digits })
}

/* === [7. Lookup Service] === */

/// Scan the store for a recovered identifier and return its shared secret.
///
/// # Errors
/// `NotFound` when no record carries the identifier.
pub fn lookup(store: &PuzzleStore, id: &PuzzleId) -> Result<SharedSecret, PuzzleError> {
    for record in store.records() {
        if record.id == *id {
            tracing::info!(
                index = record.index,
                id = %record.id,
                secret = %record.secret,
                "matched puzzle"
            );
            return Ok(record.secret.clone());
        }
    }
    tracing::warn!(id = %id, "identifier not present in the store");
    Err(PuzzleError::NotFound)
}

/* === [8. Self Test & Verification] === */

/// One full generate/solve/lookup cycle over a small store.
/// Returns `true` if the looked-up secret belongs to the solved puzzle.
pub fn self_test() -> bool {
    use rand::SeedableRng;

    let mut rng = rand::rngs::StdRng::from_entropy();
    let Ok(store) = PuzzleStore::generate_all(16, &mut rng) else {
        return false;
    };
    let Ok(solution) = solve(&store, &mut rng) else {
        return false;
    };
    let Ok(secret) = lookup(&store, &solution.id) else {
        return false;
    };

    store.records().iter().any(|r| r.id == solution.id && r.secret == secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn seeded(seed: u64) -> StdRng {
        StdRng::seed_from_u64(seed)
    }

    #[test]
    fn round_trip_every_record() {
        let mut rng = seeded(7);
        let store = PuzzleStore::generate_all(32, &mut rng).unwrap();
        for record in store.records() {
            let plain = decrypt(&record.ciphertext, &record.weak_key.key, &FIXED_IV).unwrap();
            assert_eq!(plain, record.plaintext);
        }
    }

    #[test]
    fn plaintext_layout() {
        let mut rng = seeded(1);
        let record = generate(0, &mut rng).unwrap();
        assert_eq!(&record.plaintext[..MARKER.len()], MARKER);
        assert_eq!(&record.plaintext[MARKER.len()..MARKER.len() + ID_LEN], &record.id.digits);
        assert_eq!(&record.plaintext[MARKER.len() + ID_LEN..], &record.secret.digits);
    }

    #[test]
    fn weak_key_embeds_suffix() {
        assert_eq!(&WeakKey::from_suffix(0x00).key, b"0000000000000000");
        assert_eq!(&WeakKey::from_suffix(0xab).key, b"00000000000000ab");
        assert_eq!(&WeakKey::from_suffix(0xff).key, b"00000000000000ff");
    }

    #[test]
    fn weak_keyspace_has_exactly_256_keys() {
        let keys: HashSet<_> = (0..=u8::MAX).map(|s| WeakKey::from_suffix(s).key).collect();
        assert_eq!(keys.len(), WEAK_KEYSPACE);
    }

    #[test]
    fn cipher_rejects_bad_lengths() {
        assert!(matches!(
            encrypt(b"x", b"short", &FIXED_IV),
            Err(CipherError::InvalidKeyIv)
        ));
        assert!(matches!(
            decrypt(&[0u8; CIPHERTEXT_LEN], &[0u8; KEY_LEN], b"short"),
            Err(CipherError::InvalidKeyIv)
        ));
    }

    #[test]
    fn wrong_key_decrypt_returns_garbage_not_error() {
        let mut rng = seeded(3);
        let record = generate(0, &mut rng).unwrap();
        let wrong = if record.weak_key == WeakKey::from_suffix(0x11) {
            WeakKey::from_suffix(0x22)
        } else {
            WeakKey::from_suffix(0x11)
        };
        let plain = decrypt(&record.ciphertext, &wrong.key, &FIXED_IV).unwrap();
        assert_ne!(&plain[..], &record.plaintext[..]);
    }

    #[test]
    fn end_to_end_single_puzzle() {
        let mut rng = seeded(42);
        let store = PuzzleStore::generate_all(1, &mut rng).unwrap();
        let solution = solve(&store, &mut rng).unwrap();
        assert!(solution.attempts <= WEAK_KEYSPACE);
        assert_eq!(solution.id, store.get(0).unwrap().id);

        let secret = lookup(&store, &solution.id).unwrap();
        assert_eq!(secret, store.get(0).unwrap().secret);
    }

    #[test]
    fn end_to_end_every_stored_ciphertext() {
        let mut rng = seeded(99);
        let store = PuzzleStore::generate_all(16, &mut rng).unwrap();
        for record in store.records() {
            let solution = solve_ciphertext(&record.ciphertext).unwrap();
            assert_eq!(solution.id, record.id);
            assert_eq!(solution.key, record.weak_key);
            assert!(solution.attempts <= WEAK_KEYSPACE);
            assert_eq!(lookup(&store, &solution.id).unwrap(), record.secret);
        }
    }

    #[test]
    fn solver_sweeps_whole_keyspace_for_last_key() {
        let mut plaintext = [b'a'; PLAINTEXT_LEN];
        plaintext[..MARKER.len()].copy_from_slice(MARKER);

        let key = WeakKey::from_suffix(0xff);
        let encrypted = encrypt(&plaintext, &key.key, &FIXED_IV).unwrap();
        let ciphertext: [u8; CIPHERTEXT_LEN] = encrypted.try_into().unwrap();

        let solution = solve_ciphertext(&ciphertext).unwrap();
        assert_eq!(solution.attempts, WEAK_KEYSPACE);
        assert_eq!(solution.key, key);
        assert_eq!(solution.id.digits, [b'a'; ID_LEN]);
    }

    #[test]
    fn unrelated_ciphertext_exhausts_keyspace() {
        let mut rng = seeded(1234);
        let mut ciphertext = [0u8; CIPHERTEXT_LEN];
        rng.fill(&mut ciphertext[..]);
        match solve_ciphertext(&ciphertext) {
            Err(PuzzleError::SolveFailed { attempts }) => assert_eq!(attempts, WEAK_KEYSPACE),
            other => panic!("expected SolveFailed, got {other:?}"),
        }
    }

    #[test]
    fn lookup_matches_every_record() {
        let mut rng = seeded(5);
        let store = PuzzleStore::generate_all(16, &mut rng).unwrap();
        for record in store.records() {
            assert_eq!(lookup(&store, &record.id).unwrap(), record.secret);
        }
    }

    #[test]
    fn lookup_unknown_identifier_fails() {
        let mut rng = seeded(6);
        let store = PuzzleStore::generate_all(4, &mut rng).unwrap();
        // 'z' is outside the hex alphabet, so no record can carry it
        let absent = PuzzleId { digits: [b'z'; ID_LEN] };
        assert!(matches!(lookup(&store, &absent), Err(PuzzleError::NotFound)));
    }

    #[test]
    fn no_duplicate_identifiers_in_large_store() {
        let mut rng = seeded(2024);
        let store = PuzzleStore::generate_all(DEFAULT_PUZZLE_COUNT, &mut rng).unwrap();
        let ids: HashSet<_> = store.records().iter().map(|r| r.id.digits).collect();
        assert_eq!(ids.len(), store.len());
    }

    #[test]
    fn store_rejects_out_of_sequence_insert() {
        let mut rng = seeded(8);
        let mut store = PuzzleStore::with_capacity(2);
        store.insert(generate(0, &mut rng).unwrap()).unwrap();

        let stray = generate(5, &mut rng).unwrap();
        assert!(matches!(
            store.insert(stray),
            Err(PuzzleError::IndexOutOfRange { index: 5, capacity: 2 })
        ));
    }

    #[test]
    fn store_rejects_insert_past_capacity() {
        let mut rng = seeded(9);
        let mut store = PuzzleStore::with_capacity(1);
        store.insert(generate(0, &mut rng).unwrap()).unwrap();
        assert!(matches!(
            store.insert(generate(1, &mut rng).unwrap()),
            Err(PuzzleError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn solve_on_empty_store_fails() {
        let mut rng = seeded(10);
        let store = PuzzleStore::with_capacity(0);
        assert!(matches!(
            solve(&store, &mut rng),
            Err(PuzzleError::SolveFailed { attempts: 0 })
        ));
    }

    #[test]
    fn self_test_round_trips() {
        assert!(self_test());
    }

    proptest! {
        #[test]
        fn cipher_round_trip(
            plaintext in proptest::collection::vec(any::<u8>(), 0..64),
            suffix in any::<u8>(),
        ) {
            let key = WeakKey::from_suffix(suffix);
            let ciphertext = encrypt(&plaintext, &key.key, &FIXED_IV).unwrap();
            prop_assert_eq!(ciphertext.len() % BLOCK_LEN, 0);
            let recovered = decrypt(&ciphertext, &key.key, &FIXED_IV).unwrap();
            prop_assert_eq!(recovered, plaintext);
        }
    }
}
