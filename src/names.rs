//! Container names.
//!
//! Names follow `^/?[a-zA-Z0-9][a-zA-Z0-9_.-]+$` and are stored with a
//! leading `/`. Containers created without one get a random
//! `adjective_surname` name.

use crate::constants::{NAME_FIRST_CHARS, NAME_PATTERN, NAME_VALID_CHARS};
use crate::error::{Error, Result};
use rand::Rng;

const LEFT: &[&str] = &[
    "admiring", "adoring", "agitated", "angry", "backstabbing", "berserk", "boring", "clever",
    "cocky", "compassionate", "condescending", "cranky", "desperate", "determined", "distracted",
    "dreamy", "drunk", "ecstatic", "elated", "elegant", "evil", "fervent", "focused", "furious",
    "gloomy", "goofy", "grave", "happy", "high", "hopeful", "hungry", "insane", "jolly", "jovial",
    "kickass", "lonely", "loving", "mad", "modest", "naughty", "nostalgic", "pensive", "prickly",
    "reverent", "romantic", "sad", "serene", "sharp", "sick", "silly", "sleepy", "stoic",
    "stupefied", "suspicious", "tender", "thirsty", "trusting",
];

const RIGHT: &[&str] = &[
    "albattani", "almeida", "archimedes", "ardinghelli", "babbage", "bardeen", "bartik", "bell",
    "blackwell", "bohr", "brattain", "brown", "carson", "colden", "cori", "curie", "darwin",
    "davinci", "einstein", "elion", "engelbart", "euclid", "fermat", "fermi", "feynman",
    "franklin", "galileo", "goldstine", "goodall", "hawking", "heisenberg", "hodgkin", "hoover",
    "hopper", "hypatia", "jang", "jones", "kirch", "kowalevski", "lalande", "leakey", "lovelace",
    "lumiere", "mayer", "mccarthy", "mcclintock", "mclean", "meitner", "mestorf", "morse",
    "newton", "nobel", "pare", "pasteur", "perlman", "pike", "poincare", "ptolemy", "ritchie",
    "rosalind", "sammet", "shockley", "sinoussi", "stallman", "tesla", "thompson", "torvalds",
    "turing", "wilson", "wozniak", "wright", "yalow", "yonath",
];

/// Checks a user supplied name and returns it with its leading `/`.
pub fn validate_name(name: &str) -> Result<String> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    let mut chars = bare.chars();
    let valid = match chars.next() {
        Some(first) => {
            NAME_FIRST_CHARS.contains(first)
                && bare.len() >= 2
                && chars.all(|c| NAME_VALID_CHARS.contains(c))
        }
        None => false,
    };
    if !valid {
        return Err(Error::InvalidName {
            name: name.to_string(),
            pattern: NAME_PATTERN,
        });
    }
    Ok(format!("/{}", bare))
}

/// Returns a random `adjective_surname` name.
///
/// Attempts after the first get a random digit appended, which makes a
/// collision on retry less likely.
pub fn random_name(attempt: usize) -> String {
    let mut rng = rand::rng();
    let left = LEFT[rng.random_range(0..LEFT.len())];
    let right = RIGHT[rng.random_range(0..RIGHT.len())];
    let mut name = format!("{}_{}", left, right);
    if attempt > 0 {
        name.push_str(&rng.random_range(0..10).to_string());
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert_eq!(validate_name("web").unwrap(), "/web");
        assert_eq!(validate_name("/web-1.a_b").unwrap(), "/web-1.a_b");
        assert!(validate_name("").is_err());
        assert!(validate_name("/").is_err());
        assert!(validate_name("w").is_err());
        assert!(validate_name("-web").is_err());
        assert!(validate_name("we b").is_err());
        assert!(validate_name("web/db").is_err());
    }

    #[test]
    fn test_random_names_are_valid() {
        for attempt in 0..6 {
            let name = random_name(attempt);
            assert!(validate_name(&name).is_ok(), "{}", name);
            assert_eq!(name.chars().last().unwrap().is_ascii_digit(), attempt > 0);
        }
    }
}
