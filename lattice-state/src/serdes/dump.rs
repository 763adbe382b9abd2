//! Human-readable dump of an encoded stream, for debugging.

use std::fmt::Write;

use serde_json::Value as Json;

use super::inflate::parse_tag;
use super::tags::{Constant, TypeTag};
use crate::error::{DeserializeError, DeserializeResult};

/// One line per root: index, tag name and payload.
///
/// ```
/// let dump = lattice_state::serdes::dump_state(r#"[9,[4,0,3,1],3,4]"#).unwrap();
/// assert_eq!(dump, "0 Array [4,0,3,1]\n1 Constant EmptyString\n");
/// ```
pub fn dump_state(text: &str) -> DeserializeResult<String> {
    let parsed: Json = serde_json::from_str(text)?;
    let items = parsed
        .as_array()
        .ok_or_else(|| DeserializeError::malformed("stream is not an array"))?;

    let mut out = String::new();
    for (index, pair) in items.chunks(2).enumerate() {
        let [tag, payload] = pair else {
            return Err(DeserializeError::malformed("stream has an odd number of entries"));
        };
        let tag = parse_tag(tag)?;
        let detail = match tag {
            TypeTag::Constant => payload
                .as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .and_then(Constant::from_u8)
                .map_or_else(|| payload.to_string(), |c| format!("{c:?}")),
            TypeTag::RootRef => format!("-> {payload}"),
            _ => payload.to_string(),
        };
        let _ = writeln!(out, "{index} {} {detail}", tag.name());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_every_root() {
        let dump = dump_state("[0,1,10,[\"a\",4,1],2,[1]]").unwrap();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines, vec!["0 RootRef -> 1", "1 Object [\"a\",4,1]", "2 ForwardRefs [1]"]);
    }
}
