//! Display-phrase generation with an embedded CRC32 version tag.
//!
//! Searches for a phrase of `words_in_prefix + 3` BIP-39 English words whose
//! raw CRC32 register (zero init, no final xor), run over the concatenated
//! words, lands exactly on the requested 32-bit version tag. The prefix
//! carries the entropy; the three suffix words are found by meeting in the
//! middle: candidate final words are indexed by the register value that must
//! precede them (computed by stepping the CRC backwards), then the two
//! middle words are enumerated by length so one shared zero-padded register
//! advance covers each length bucket.

use std::collections::HashMap;
use std::sync::OnceLock;

use rand::Rng;

pub const BITS_PER_WORD: usize = 11; // 2048-word list
const WORDS_MIN_LEN: usize = 3;
const WORDS_MAX_LEN: usize = 8;

struct WordTables {
    words: &'static [&'static str; 2048],
    crc_table: [u32; 256],
    /// Top byte of a table entry back to its index; the reflected CRC32
    /// polynomial makes those top bytes a permutation of 0..=255.
    reverse_index: [u8; 256],
    /// CRC32 of each word processed from a zero register. Because the CRC is
    /// GF(2)-linear, processing a word from any state equals stepping that
    /// state through len(word) zero bytes and xoring this adjustment in.
    word_adj: Vec<u32>,
    /// Word indices bucketed by length, WORDS_MIN_LEN..=WORDS_MAX_LEN.
    words_by_len: Vec<Vec<usize>>,
}

fn crc32_byte(table: &[u32; 256], crc: u32, byte: u8) -> u32 {
    (crc >> 8) ^ table[((crc ^ byte as u32) & 0xff) as usize]
}

fn tables() -> &'static WordTables {
    static TABLES: OnceLock<WordTables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut crc_table = [0u32; 256];
        for (i, entry) in crc_table.iter_mut().enumerate() {
            let mut crc = i as u32;
            for _ in 0..8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
            }
            *entry = crc;
        }
        let mut reverse_index = [0u8; 256];
        for (i, entry) in crc_table.iter().enumerate() {
            reverse_index[(entry >> 24) as usize] = i as u8;
        }

        let words = bip39::Language::English.word_list();
        let mut word_adj = Vec::with_capacity(words.len());
        let mut words_by_len = vec![Vec::new(); WORDS_MAX_LEN + 1];
        for (i, word) in words.iter().enumerate() {
            let mut crc = 0u32;
            for &b in word.as_bytes() {
                crc = crc32_byte(&crc_table, crc, b);
            }
            word_adj.push(crc);
            debug_assert!((WORDS_MIN_LEN..=WORDS_MAX_LEN).contains(&word.len()));
            words_by_len[word.len()].push(i);
        }

        WordTables {
            words,
            crc_table,
            reverse_index,
            word_adj,
            words_by_len,
        }
    })
}

impl WordTables {
    /// Advance the register through one zero byte.
    fn step_zero(&self, crc: u32) -> u32 {
        (crc >> 8) ^ self.crc_table[(crc & 0xff) as usize]
    }

    /// Inverse of [`step_zero`].
    fn reverse_step_zero(&self, crc: u32) -> u32 {
        let i = self.reverse_index[(crc >> 24) as usize];
        ((crc ^ self.crc_table[i as usize]) << 8) | i as u32
    }
}

/// Raw CRC32 register over the concatenated words of a phrase; equals the
/// version tag the phrase was generated for.
pub fn phrase_crc32(phrase: &str) -> u32 {
    let t = tables();
    let mut crc = 0u32;
    for word in phrase.split_whitespace() {
        for &b in word.as_bytes() {
            crc = crc32_byte(&t.crc_table, crc, b);
        }
    }
    crc
}

/// Generate a phrase of `(bits - 1) / BITS_PER_WORD + 1 + 3` words whose
/// [`phrase_crc32`] equals `version`.
///
/// Termination is probabilistic but rapid: each random prefix exposes about
/// 2^22 suffix pairs to a 2^11-entry final-word table.
pub fn generate_mnemonic(bits: usize, version: u32) -> String {
    let t = tables();

    // For each candidate final word, the register value that must precede it.
    let mut last_word: HashMap<u32, usize> = HashMap::with_capacity(t.words.len());
    for (i, word) in t.words.iter().enumerate() {
        let mut crc_suffix = version ^ t.word_adj[i];
        for _ in 0..word.len() {
            crc_suffix = t.reverse_step_zero(crc_suffix);
        }
        last_word.insert(crc_suffix, i);
    }

    let words_in_prefix = (bits - 1) / BITS_PER_WORD + 1;
    let mut rng = rand::thread_rng();
    let mut word_ids = Vec::with_capacity(words_in_prefix + 3);

    loop {
        word_ids.clear();
        let mut crc_prefix = 0u32;
        for _ in 0..words_in_prefix {
            let j = rng.gen_range(0..t.words.len());
            word_ids.push(j);
            for _ in 0..t.words[j].len() {
                crc_prefix = t.step_zero(crc_prefix);
            }
            crc_prefix ^= t.word_adj[j];
        }

        // The shared register advance for the shortest possible middle word;
        // each longer length bucket adds one more zero step.
        for _ in 0..WORDS_MIN_LEN {
            crc_prefix = t.step_zero(crc_prefix);
        }
        let mut crc1 = crc_prefix;
        for l1 in WORDS_MIN_LEN..=WORDS_MAX_LEN {
            for &w1 in &t.words_by_len[l1] {
                let mut crc2 = crc1 ^ t.word_adj[w1];
                for _ in 0..WORDS_MIN_LEN {
                    crc2 = t.step_zero(crc2);
                }
                for l2 in WORDS_MIN_LEN..=WORDS_MAX_LEN {
                    for &w2 in &t.words_by_len[l2] {
                        if let Some(&w3) = last_word.get(&(crc2 ^ t.word_adj[w2])) {
                            word_ids.push(w1);
                            word_ids.push(w2);
                            word_ids.push(w3);
                            let phrase: Vec<&str> =
                                word_ids.iter().map(|&id| t.words[id]).collect();
                            return phrase.join(" ");
                        }
                    }
                    if l2 < WORDS_MAX_LEN {
                        crc2 = t.step_zero(crc2);
                    }
                }
            }
            if l1 < WORDS_MAX_LEN {
                crc1 = t.step_zero(crc1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reverse_index_is_permutation() {
        let t = tables();
        let mut seen = [false; 256];
        for entry in &t.crc_table {
            let top = (entry >> 24) as usize;
            assert!(!seen[top], "table top bytes must be distinct");
            seen[top] = true;
        }
    }

    #[test]
    fn test_reverse_step_inverts_step() {
        let t = tables();
        let mut crc = 0x1234_5678u32;
        for _ in 0..64 {
            let stepped = t.step_zero(crc);
            assert_eq!(t.reverse_step_zero(stepped), crc);
            crc = stepped.wrapping_mul(2654435761).wrapping_add(1);
        }
    }

    #[test]
    fn test_word_adj_decomposition() {
        // Processing a word from any state == zero steps + adjustment.
        let t = tables();
        let word = t.words[777];
        let state = 0xDEAD_BEEFu32;
        let mut direct = state;
        for &b in word.as_bytes() {
            direct = crc32_byte(&t.crc_table, direct, b);
        }
        let mut stepped = state;
        for _ in 0..word.len() {
            stepped = t.step_zero(stepped);
        }
        assert_eq!(direct, stepped ^ t.word_adj[777]);
    }

    #[test]
    fn test_generate_mnemonic_hits_version() {
        for version in [0u32, 1, 0xDEAD_BEEF, 0xFFFF_FFFF] {
            let phrase = generate_mnemonic(128, version);
            assert_eq!(phrase_crc32(&phrase), version, "phrase: {phrase}");
        }
    }

    #[test]
    fn test_generate_mnemonic_word_count() {
        // 192 bits over 11-bit words -> 18 prefix words + 3 suffix words.
        let phrase = generate_mnemonic(192, 7);
        assert_eq!(phrase.split_whitespace().count(), 21);
        let t = tables();
        for word in phrase.split_whitespace() {
            assert!(t.words.contains(&word));
        }
    }

    #[test]
    fn test_generate_mnemonic_randomized_prefix() {
        let a = generate_mnemonic(128, 42);
        let b = generate_mnemonic(128, 42);
        assert_ne!(a, b);
        assert_eq!(phrase_crc32(&a), 42);
        assert_eq!(phrase_crc32(&b), 42);
    }
}
