//! Backslash-escaping helpers and the text encodings used on the
//! inter-server wire: data versions, the gossip blob, and the reshard-move
//! body. [`crate::core::shard_scheme`] has its own (de)serialisation built
//! on top of [`escape_chars`]/[`unescape_chars`].

use crate::core::vector_clock::VectorClock;

/// Prepends a backslash to every character in `chars` (and to every literal
/// backslash already present).
pub fn escape_chars(s: &str, chars: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch == '\\' || chars.contains(ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Inverse of [`escape_chars`]: drops every backslash, keeping the
/// character that followed it.
pub fn unescape_chars(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Byte index of the next unescaped occurrence of `look_for`, or `None`.
pub fn find_next_unescaped_char(s: &str, look_for: char) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut idx = 0;
    while let Some(rel) = s[idx..].find(look_for) {
        let pos = idx + rel;
        if pos == 0 || bytes[pos - 1] != b'\\' {
            return Some(pos);
        }
        idx = pos + look_for.len_utf8();
    }
    None
}

/// A value plus its causal clock. `value` empty denotes a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataVersion {
    pub value: String,
    pub clock: VectorClock,
}

impl DataVersion {
    pub fn new(value: String, clock: VectorClock) -> Self {
        DataVersion { value, clock }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }

    pub fn encode(&self) -> String {
        format!("{}|{}", self.clock.to_string_encoding(), self.value)
    }

    pub fn decode(s: &str) -> DataVersion {
        match s.split_once('|') {
            Some((clock, value)) => {
                DataVersion::new(value.to_string(), VectorClock::from_string_encoding(clock))
            }
            None => DataVersion::new(String::new(), VectorClock::from_string_encoding(s)),
        }
    }
}

/// `"<schemeVersion>|<clock>|<value>"`.
pub fn encode_data_version_with_scheme(version: i32, data: &DataVersion) -> String {
    format!("{}|{}", version, data.encode())
}

pub fn decode_data_version_with_scheme(s: &str) -> Option<(DataVersion, i32)> {
    let (version, rest) = s.split_once('|')?;
    let version: i32 = version.parse().ok()?;
    Some((DataVersion::decode(rest), version))
}

/// Concatenation of `"<key>|<clock>|<value>$"` per entry. Keys and values
/// containing `|` or `$` will corrupt this encoding; this is a documented
/// limitation, not a bug to silently patch (see the reshard/gossip design
/// notes).
pub fn encode_gossip_blob(entries: &[(&String, &DataVersion)]) -> String {
    let mut out = String::new();
    for (key, data) in entries {
        out.push_str(key);
        out.push('|');
        out.push_str(&data.encode());
        out.push('$');
    }
    out
}

pub fn decode_gossip_blob(blob: &str) -> Vec<(String, DataVersion)> {
    let mut out = Vec::new();
    let mut rest = blob;
    while let Some(pipe) = rest.find('|') {
        let key = &rest[..pipe];
        let after_pipe = &rest[pipe + 1..];
        let Some(dollar) = after_pipe.find('$') else {
            break;
        };
        let entry = &after_pipe[..dollar];
        out.push((key.to_string(), DataVersion::decode(entry)));
        rest = &after_pipe[dollar + 1..];
    }
    out
}

/// `"<version>&<escaped-key>&<escaped-dataVersion>"`.
pub fn encode_reshard_move(version: i32, key: &str, data: &DataVersion) -> String {
    let escape_set = "&";
    format!(
        "{}&{}&{}",
        version,
        escape_chars(key, escape_set),
        escape_chars(&data.encode(), escape_set)
    )
}

pub fn decode_reshard_move(body: &str) -> Option<(i32, String, DataVersion)> {
    let first_amp = find_next_unescaped_char(body, '&')?;
    let remaining = &body[first_amp + 1..];
    let second_amp = find_next_unescaped_char(remaining, '&')?;

    let version_str = &body[..first_amp];
    let key_str = &remaining[..second_amp];
    let val_str = &remaining[second_amp + 1..];

    let version: i32 = version_str.parse().ok()?;
    let key = unescape_chars(key_str);
    let data = DataVersion::decode(&unescape_chars(val_str));

    Some((version, key, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trips() {
        for s in ["plain", "a b", "a\\b", "a&b\\c", ""] {
            assert_eq!(unescape_chars(&escape_chars(s, "& ")), s);
        }
    }

    #[test]
    fn data_version_round_trips() {
        let clock = VectorClock::from_string_encoding("");
        let dv = DataVersion::new("hello".to_string(), clock);
        let decoded = DataVersion::decode(&dv.encode());
        assert_eq!(decoded.value, "hello");
    }

    #[test]
    fn gossip_blob_round_trips_simple_entries() {
        let clock = VectorClock::from_string_encoding("");
        let k1 = "k1".to_string();
        let d1 = DataVersion::new("v1".to_string(), clock.clone());
        let k2 = "k2".to_string();
        let d2 = DataVersion::new(String::new(), clock);

        let blob = encode_gossip_blob(&[(&k1, &d1), (&k2, &d2)]);
        let decoded = decode_gossip_blob(&blob);

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].0, "k1");
        assert_eq!(decoded[0].1.value, "v1");
        assert_eq!(decoded[1].0, "k2");
        assert!(decoded[1].1.is_tombstone());
    }

    #[test]
    fn reshard_move_round_trips_with_ampersand_in_key() {
        let clock = VectorClock::from_string_encoding("");
        let data = DataVersion::new("v&al".to_string(), clock);
        let encoded = encode_reshard_move(4, "weird&key", &data);
        let (version, key, decoded) = decode_reshard_move(&encoded).unwrap();
        assert_eq!(version, 4);
        assert_eq!(key, "weird&key");
        assert_eq!(decoded.value, "v&al");
    }
}
