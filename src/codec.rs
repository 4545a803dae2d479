use log::warn;

/// Parity token produced when there is nothing to fold.
pub const EMPTY_PARITY: &str = "0000";

/// XOR-folds the bytes of every payload character.
///
/// Only ASCII survives the mod-128 recovery on the way back, so anything
/// wider is skipped rather than silently corrupting the token.
fn fold(payloads: &[&str]) -> u32 {
    let mut acc = 0u32;
    for payload in payloads {
        for ch in payload.chars() {
            if ch.is_ascii() {
                acc ^= ch as u32;
            } else {
                warn!("codec: skipping non-ASCII character {:?} in parity recompute", ch);
            }
        }
    }
    acc
}

/// Position-weighted fold used by the Q syndrome: the i-th character is
/// shifted left by its position before being XORed in.
fn weighted_fold(payloads: &[&str]) -> u32 {
    let mut acc = 0u32;
    let mut position = 0u32;
    for payload in payloads {
        for ch in payload.chars() {
            if ch.is_ascii() {
                // wrapping_shl keeps long stripes from overflowing the shift.
                acc ^= (ch as u32).wrapping_shl(position);
            } else {
                warn!("codec: skipping non-ASCII character {:?} in syndrome recompute", ch);
            }
            position += 1;
        }
    }
    acc
}

fn render(tag: char, value: u32) -> String {
    let mut token = format!("{}{:03}", tag, value);
    token.truncate(4);
    token
}

/// P-parity token for a stripe's data payloads, rendered `P%03d` and
/// clipped to four characters. Empty input yields [`EMPTY_PARITY`].
pub fn p_parity(payloads: &[&str]) -> String {
    if payloads.iter().all(|p| p.is_empty()) {
        return EMPTY_PARITY.to_string();
    }
    render('P', fold(payloads))
}

/// Q-syndrome token: the weighted fold mixed with `lba mod 100`, rendered
/// `Q%03d` and clipped to four characters.
pub fn q_parity(payloads: &[&str], lba: u64) -> String {
    if payloads.iter().all(|p| p.is_empty()) {
        return EMPTY_PARITY.to_string();
    }
    render('Q', (weighted_fold(payloads) ^ (lba % 100) as u32) % 1000)
}

/// Numeric value carried by a rendered parity token (`"P065"` -> 65).
pub fn token_value(token: &str) -> Option<u32> {
    let digits = token.strip_prefix('P').or_else(|| token.strip_prefix('Q'))?;
    digits.parse().ok()
}

fn to_char(value: u32) -> char {
    (value % 128) as u8 as char
}

/// Recovers a missing data character from a P token and the stripe's
/// surviving data payloads.
pub fn invert_p(token: &str, surviving: &[&str]) -> Option<char> {
    let value = token_value(token)?;
    Some(to_char(value ^ fold(surviving)))
}

/// Recovers a missing data character from a Q token, undoing the positional
/// mixer for the given LBA.
pub fn invert_q(token: &str, surviving: &[&str], lba: u64) -> Option<char> {
    let value = token_value(token)?;
    Some(to_char(value ^ weighted_fold(surviving) ^ (lba % 100) as u32))
}
