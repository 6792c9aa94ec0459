//! Order number checksum.

/// Returns `true` for a non-empty string of ASCII digits whose Luhn sum is
/// divisible by ten.
///
/// Digits are scanned from the right; every second digit starting with the
/// second-from-right is doubled, and doubled values above 9 have 9
/// subtracted.
pub fn validate(number: &str) -> bool {
    if number.is_empty() {
        return false;
    }

    let mut sum = 0u32;
    for (i, c) in number.bytes().rev().enumerate() {
        if !c.is_ascii_digit() {
            return false;
        }
        let mut digit = u32::from(c - b'0');
        if i % 2 == 1 {
            digit *= 2;
            if digit > 9 {
                digit -= 9;
            }
        }
        sum += digit;
    }

    sum % 10 == 0
}
