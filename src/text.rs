//! Phoneme symbol inventory.
//!
//! Index 0 is the pad symbol `_`, followed by punctuation, Latin letters and
//! IPA letters. Text normalisation and grapheme-to-phoneme conversion happen
//! upstream; this module only maps an already-phonemised string to ids.
//!
//! A second inventory for Vietnamese (tone-marked letters instead of IPA) is
//! laid out as pad, letters, punctuation.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::{Error, Result};

/// Padding symbol, always id 0.
pub const PAD: char = '_';

const PUNCTUATION: &str = ";:,.!?¡¿—…\"«»“” ";
const LETTERS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const LETTERS_IPA: &str = "ɑɐɒæɓʙβɔɕçɗɖðʤəɘɚɛɜɝɞɟʄɡɠɢʛɦɧħɥʜɨɪʝɭɬɫɮʟɱɯɰŋɳɲɴøɵɸθœɶʘɹɺɾɻʀʁɽʂʃʈʧʉʊʋⱱʌɣɤʍχʎʏʑʐʒʔʡʕʢǀǁǂǃˈˌːˑʼʴʰʱʲʷˠˤ˞↓↑→↗↘'̩'ᵻ";

const VIETNAMESE_LETTERS: &str = "aàáảãạăằắẳẵặâầấẩẫậbcddèéẻẽẹêềếểễệghiìíỉĩịklmnoòóỏõọôồốổỗộơờớởỡợpqrsutùúủũụưừứửữựvxyỳýỷỹỵ";

static SYMBOLS: Lazy<Vec<char>> = Lazy::new(|| {
    std::iter::once(PAD)
        .chain(PUNCTUATION.chars())
        .chain(LETTERS.chars())
        .chain(LETTERS_IPA.chars())
        .collect()
});

static VIETNAMESE_SYMBOLS: Lazy<Vec<char>> = Lazy::new(|| {
    std::iter::once(PAD)
        .chain(VIETNAMESE_LETTERS.chars())
        .chain(PUNCTUATION.chars())
        .collect()
});

/// First occurrence wins; both inventories repeat a letter.
fn index(symbols: &[char]) -> HashMap<char, u32> {
    let mut table = HashMap::new();
    for (id, &c) in symbols.iter().enumerate() {
        table.entry(c).or_insert(id as u32);
    }
    table
}

static SYMBOL_TO_ID: Lazy<HashMap<char, u32>> = Lazy::new(|| index(&SYMBOLS));
static VIETNAMESE_SYMBOL_TO_ID: Lazy<HashMap<char, u32>> =
    Lazy::new(|| index(&VIETNAMESE_SYMBOLS));

/// All symbols in id order.
pub fn symbols() -> &'static [char] {
    &SYMBOLS
}

/// Vietnamese symbols in id order.
pub fn vietnamese_symbols() -> &'static [char] {
    &VIETNAMESE_SYMBOLS
}

/// Id of the word separator.
pub fn space_id() -> u32 {
    SYMBOL_TO_ID[&' ']
}

fn lookup(table: &HashMap<char, u32>, text: &str) -> Result<Vec<u32>> {
    text.chars()
        .map(|c| {
            table
                .get(&c)
                .copied()
                .ok_or_else(|| Error::InvalidInput(format!("unknown phoneme symbol {c:?}")))
        })
        .collect()
}

/// Map a phonemised string to symbol ids.
pub fn text_to_ids(text: &str) -> Result<Vec<u32>> {
    lookup(&SYMBOL_TO_ID, text)
}

/// Map Vietnamese text to ids of the Vietnamese inventory.
pub fn vietnamese_text_to_ids(text: &str) -> Result<Vec<u32>> {
    lookup(&VIETNAMESE_SYMBOL_TO_ID, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_is_zero() {
        assert_eq!(symbols()[0], PAD);
        assert_eq!(text_to_ids("_").unwrap(), vec![0]);
    }

    #[test]
    fn space_follows_punctuation() {
        // pad + 16 punctuation marks, space is the last of them
        assert_eq!(space_id(), 16);
    }

    #[test]
    fn ipa_string_maps() {
        let ids = text_to_ids("həˈloʊ wɜːld").unwrap();
        assert_eq!(ids.len(), 12);
        assert!(ids.iter().all(|&id| (id as usize) < symbols().len()));
        assert_eq!(ids[6], space_id());
    }

    #[test]
    fn vietnamese_inventory() {
        let symbols = vietnamese_symbols();
        assert_eq!(symbols[0], PAD);
        assert_eq!(symbols[1], 'a');
        assert_eq!(symbols.last(), Some(&' '));
        let ids = vietnamese_text_to_ids("xin chào").unwrap();
        assert_eq!(ids.len(), 8);
        assert_eq!(ids[3] as usize, symbols.len() - 1);
        // Tone-marked letters are not part of the IPA inventory.
        assert!(text_to_ids("chào").is_err());
    }

    #[test]
    fn unknown_symbol_rejected() {
        assert!(matches!(text_to_ids("a#b"), Err(Error::InvalidInput(_))));
    }
}
