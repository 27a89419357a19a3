//! Prize derivation: 4-digit number, suffixes and the 25-group animal table.

use serde::{Deserialize, Serialize};

pub const MAX_PRIZE_POSITIONS: u8 = 15;

/// Group labels indexed by `group_index - 1`. Each group owns four
/// consecutive two-digit endings (01-04, 05-08, ... 97-00).
pub const ANIMAL_GROUPS: [&str; 25] = [
    "ostrich", "eagle", "donkey", "butterfly", "dog", "goat", "ram", "camel", "snake",
    "rabbit", "horse", "elephant", "rooster", "cat", "alligator", "lion", "monkey", "pig",
    "peacock", "turkey", "bull", "tiger", "bear", "deer", "cow",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prize {
    pub position: u8,
    pub raw_value: String,
    pub last4: String,
    pub last3: String,
    pub last2: String,
    pub group_index: u8,
    pub animal_label: String,
}

impl Prize {
    /// Builds a prize from a raw provider value. Returns `None` for empty
    /// and placeholder values and for positions outside `1..=15`.
    pub fn derive(position: u8, raw: &str) -> Option<Self> {
        if position == 0 || position > MAX_PRIZE_POSITIONS {
            return None;
        }
        let raw = raw.trim();
        let last4 = four_digit_number(raw)?;
        let last2_value: u8 = last4[2..].parse().ok()?;
        let group_index = group_for_ending(last2_value);
        Some(Self {
            position,
            raw_value: raw.to_string(),
            last3: last4[1..].to_string(),
            last2: last4[2..].to_string(),
            last4,
            group_index,
            animal_label: animal_label(group_index).to_string(),
        })
    }
}

/// True when the provider value carries an actual number.
pub fn is_non_empty_prize(raw: &str) -> bool {
    four_digit_number(raw.trim()).is_some()
}

/// Leading digit run of the value (before any `-` or `/` annotation),
/// left-padded and cut to its last four digits.
fn four_digit_number(raw: &str) -> Option<String> {
    let digits: String = raw
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    let padded = format!("{digits:0>4}");
    Some(padded[padded.len() - 4..].to_string())
}

pub fn group_for_ending(last2: u8) -> u8 {
    match last2 % 100 {
        0 => 25,
        n => (n - 1) / 4 + 1,
    }
}

pub fn animal_label(group_index: u8) -> &'static str {
    group_index
        .checked_sub(1)
        .and_then(|i| ANIMAL_GROUPS.get(i as usize))
        .copied()
        .unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_suffixes_and_group() {
        let prize = Prize::derive(1, "4321").unwrap();
        assert_eq!(prize.last4, "4321");
        assert_eq!(prize.last3, "321");
        assert_eq!(prize.last2, "21");
        assert_eq!(prize.group_index, 6);
        assert_eq!(prize.animal_label, "goat");
    }

    #[test]
    fn ending_zero_zero_is_last_group() {
        let prize = Prize::derive(2, "1200").unwrap();
        assert_eq!(prize.group_index, 25);
        assert_eq!(prize.animal_label, "cow");
        assert_eq!(group_for_ending(1), 1);
        assert_eq!(group_for_ending(4), 1);
        assert_eq!(group_for_ending(5), 2);
        assert_eq!(group_for_ending(97), 25);
    }

    #[test]
    fn short_and_long_values_are_normalized_to_four_digits() {
        assert_eq!(Prize::derive(7, "123").unwrap().last4, "0123");
        assert_eq!(Prize::derive(1, "98765").unwrap().last4, "8765");
        assert_eq!(Prize::derive(3, "0457-12").unwrap().last4, "0457");
    }

    #[test]
    fn placeholders_never_become_prizes() {
        for raw in ["", "   ", "-", "----", "null"] {
            assert!(Prize::derive(1, raw).is_none(), "{raw:?}");
            assert!(!is_non_empty_prize(raw));
        }
        assert!(Prize::derive(0, "1234").is_none());
        assert!(Prize::derive(16, "1234").is_none());
    }
}
