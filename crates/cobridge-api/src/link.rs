use serde::{Deserialize, Serialize};

/// Link policy as carried on the wire (`p: {bm}`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPolicy {
    pub bm: u8,
}

/// One entry of a discovery or resource-directory payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLink {
    pub href: String,
    #[serde(default)]
    pub rt: Vec<String>,
    #[serde(rename = "if", default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub p: LinkPolicy,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub anchor: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub di: String,
}

impl ResourceLink {
    /// Returns `true` if the link advertises resource type `rt`.
    pub fn has_type(&self, rt: &str) -> bool {
        self.rt.iter().any(|t| t == rt)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::codec;

    #[test]
    fn interfaces_use_the_if_key() {
        let link = ResourceLink {
            href: "/light".into(),
            rt: vec!["oic.r.switch.binary".into()],
            interfaces: vec!["oic.if.a".into()],
            p: LinkPolicy { bm: 3 },
            ..ResourceLink::default()
        };
        let value: ciborium::Value = codec::decode(&codec::encode(&link).unwrap()).unwrap();
        let keys: Vec<String> = value
            .as_map()
            .unwrap()
            .iter()
            .filter_map(|(k, _)| k.as_text().map(str::to_owned))
            .collect();
        assert!(keys.contains(&"if".to_owned()));
        assert!(!keys.contains(&"anchor".to_owned()));
        assert!(link.has_type("oic.r.switch.binary"));
    }
}
