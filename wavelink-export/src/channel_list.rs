//! Per-destination channel allow-lists and the restricted-channel list.
//!
//! A channel file holds one entry per line.  A plain entry is a channel code
//! (`NNSSSSSCCCLL`, space padded to 12 characters).  An entry containing
//! regex metacharacters is compiled as a pattern anchored at both ends and
//! matched against the padded 12-character code, so `CI.*BH.*` forwards every
//! `BH?` channel of network `CI`.  `#` starts a comment line.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

// ---

use regex::Regex;
use tracing::warn;

// ---

use wavelink_domain::{ChannelCode, RestrictedSet, Result, WaveLinkError};

// ---

const PATTERN_CHARS: &[char] = &['.', '*', '+', '?', '[', ']', '(', ')', '{', '}', '|', '^', '$', '\\'];

// ---------------------------------------------------------------------------
// ChannelFilter
// ---------------------------------------------------------------------------

/// Destination allow-list.  An empty filter allows nothing.
#[derive(Debug, Clone, Default)]
pub struct ChannelFilter {
    // ---
    exact: HashSet<ChannelCode>,
    patterns: Vec<Regex>,
}

// ---

impl ChannelFilter {
    // ---
    pub fn parse(text: &str) -> Self {
        // ---
        let mut filter = Self::default();
        for line in text.lines() {
            let entry = line.trim_end_matches(['\r', '\n']);
            if entry.trim().is_empty() || entry.trim_start().starts_with('#') {
                continue;
            }

            if entry.contains(PATTERN_CHARS) {
                match Regex::new(&format!("^(?:{})$", entry.trim())) {
                    Ok(re) => filter.patterns.push(re),
                    Err(e) => warn!(entry, "skipping bad channel pattern: {e}"),
                }
            } else {
                filter.exact.insert(ChannelCode::new(entry.trim_start()));
            }
        }
        filter
    }

    /// Read and parse a channel file.
    pub fn load(path: &Path) -> Result<Self> {
        // ---
        let text = fs::read_to_string(path).map_err(|e| {
            WaveLinkError::Config(format!("cannot read channel file {}: {e}", path.display()))
        })?;
        Ok(Self::parse(&text))
    }

    // ---

    pub fn allows(&self, channel: &ChannelCode) -> bool {
        self.exact.contains(channel) || self.patterns.iter().any(|re| re.is_match(channel.as_str()))
    }

    /// Number of entries (exact codes plus patterns).
    pub fn len(&self) -> usize {
        self.exact.len() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// load_restricted
// ---------------------------------------------------------------------------

/// Load the restricted-channel list: one exact channel code per line.
pub fn load_restricted(path: &Path) -> Result<RestrictedSet> {
    // ---
    let text = fs::read_to_string(path).map_err(|e| {
        WaveLinkError::Config(format!("cannot read restricted list {}: {e}", path.display()))
    })?;
    Ok(RestrictedSet::new(
        text.lines()
            .filter(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
            .map(|l| ChannelCode::new(l.trim_start())),
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use wavelink_domain::ChannelDirectory;

    fn code(net: &str, sta: &str, chan: &str, loc: &str) -> ChannelCode {
        ChannelCode::from_parts(net, sta, chan, loc)
    }

    #[test]
    fn exact_codes_match_only_themselves() {
        // ---
        let f = ChannelFilter::parse("CIPASC BHZ  \nCIPASC BHN  \n");
        assert_eq!(f.len(), 2);
        assert!(f.allows(&code("CI", "PASC", "BHZ", "")));
        assert!(!f.allows(&code("CI", "PASC", "BHE", "")));
    }

    #[test]
    fn patterns_are_anchored() {
        // ---
        let f = ChannelFilter::parse("CI.*BH.*\n");
        assert!(f.allows(&code("CI", "PASC", "BHZ", "")));
        assert!(f.allows(&code("CI", "USC", "BHE", "00")));
        assert!(!f.allows(&code("AZ", "CIBH", "HHZ", "")));
        assert!(!f.allows(&code("NC", "CI", "BHZ", "")));

        // The location padding is part of the code.
        let short = ChannelFilter::parse("CI.*BH.\n");
        assert!(!short.allows(&code("CI", "PASC", "BHZ", "")));
    }

    #[test]
    fn empty_filter_allows_nothing() {
        // ---
        let f = ChannelFilter::parse("# nothing here\n\n");
        assert!(f.is_empty());
        assert!(!f.allows(&code("CI", "PASC", "BHZ", "")));
    }

    #[test]
    fn bad_pattern_is_skipped() {
        // ---
        let f = ChannelFilter::parse("CI(\nCIPASC BHZ  \n");
        assert_eq!(f.len(), 1);
        assert!(f.allows(&code("CI", "PASC", "BHZ", "")));
    }

    #[test]
    fn files_load_from_disk() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let chans = dir.path().join("ew1.chan");
        let restricted = dir.path().join("restricted");
        fs::write(&chans, "CI.*\n").unwrap();
        fs::write(&restricted, "CISECR HHZ  \n").unwrap();

        assert!(ChannelFilter::load(&chans).unwrap().allows(&code("CI", "X", "HHZ", "")));
        let set = load_restricted(&restricted).unwrap();
        assert!(set.is_restricted(&code("CI", "SECR", "HHZ", "")));
        assert!(!set.is_restricted(&code("CI", "PASC", "HHZ", "")));
        assert!(ChannelFilter::load(&dir.path().join("missing")).is_err());
    }
}
