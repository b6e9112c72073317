//! Typed port descriptions used to decide whether two stages can be linked

use std::collections::BTreeMap;
use std::fmt;

/// Value of a single caps field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapsValue {
    Fixed(String),
    OneOf(Vec<String>),
}

impl CapsValue {
    fn values(&self) -> Vec<&str> {
        match self {
            CapsValue::Fixed(v) => vec![v.as_str()],
            CapsValue::OneOf(vs) => vs.iter().map(String::as_str).collect(),
        }
    }

    fn intersect(&self, other: &CapsValue) -> Option<CapsValue> {
        let theirs = other.values();
        let common: Vec<String> = self
            .values()
            .into_iter()
            .filter(|v| theirs.contains(v))
            .map(str::to_string)
            .collect();
        match common.len() {
            0 => None,
            1 => common.into_iter().next().map(CapsValue::Fixed),
            _ => Some(CapsValue::OneOf(common)),
        }
    }
}

impl fmt::Display for CapsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapsValue::Fixed(v) => f.write_str(v),
            CapsValue::OneOf(vs) => write!(f, "{{ {} }}", vs.join(", ")),
        }
    }
}

/// One media type with constrained fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Structure {
    pub media_type: String,
    pub fields: BTreeMap<String, CapsValue>,
}

impl Structure {
    /// Field value, when the field is fixed
    pub fn get(&self, field: &str) -> Option<&str> {
        match self.fields.get(field) {
            Some(CapsValue::Fixed(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    fn intersect(&self, other: &Structure) -> Option<Structure> {
        if self.media_type != other.media_type {
            return None;
        }
        let mut fields = self.fields.clone();
        for (key, theirs) in &other.fields {
            let merged = match self.fields.get(key) {
                Some(ours) => ours.intersect(theirs)?,
                None => theirs.clone(),
            };
            fields.insert(key.clone(), merged);
        }
        Some(Structure {
            media_type: self.media_type.clone(),
            fields,
        })
    }
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.media_type)?;
        for (key, value) in &self.fields {
            write!(f, ", {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Capabilities of a stage port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caps {
    /// Accepts anything
    Any,
    /// Accepts any of the listed structures; empty means nothing
    List(Vec<Structure>),
}

impl Caps {
    pub fn any() -> Caps {
        Caps::Any
    }

    pub fn empty() -> Caps {
        Caps::List(Vec::new())
    }

    pub fn builder(media_type: &str) -> CapsBuilder {
        CapsBuilder {
            structure: Structure {
                media_type: media_type.to_string(),
                fields: BTreeMap::new(),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Caps::List(list) if list.is_empty())
    }

    /// Append the structures of `other`
    pub fn merge(self, other: Caps) -> Caps {
        match (self, other) {
            (Caps::Any, _) | (_, Caps::Any) => Caps::Any,
            (Caps::List(mut ours), Caps::List(theirs)) => {
                ours.extend(theirs);
                Caps::List(ours)
            }
        }
    }

    /// Common subset of both caps
    pub fn intersect(&self, other: &Caps) -> Caps {
        match (self, other) {
            (Caps::Any, caps) | (caps, Caps::Any) => caps.clone(),
            (Caps::List(ours), Caps::List(theirs)) => Caps::List(
                ours.iter()
                    .flat_map(|a| theirs.iter().filter_map(move |b| a.intersect(b)))
                    .collect(),
            ),
        }
    }

    /// Whether data described by `self` can flow into a port accepting `other`
    pub fn can_intersect(&self, other: &Caps) -> bool {
        !self.intersect(other).is_empty()
    }

    /// First structure, if any
    pub fn structure(&self) -> Option<&Structure> {
        match self {
            Caps::Any => None,
            Caps::List(list) => list.first(),
        }
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Caps::Any => f.write_str("ANY"),
            Caps::List(list) if list.is_empty() => f.write_str("EMPTY"),
            Caps::List(list) => {
                let parts: Vec<String> = list.iter().map(Structure::to_string).collect();
                f.write_str(&parts.join("; "))
            }
        }
    }
}

pub struct CapsBuilder {
    structure: Structure,
}

impl CapsBuilder {
    pub fn field(mut self, key: &str, value: impl ToString) -> Self {
        self.structure
            .fields
            .insert(key.to_string(), CapsValue::Fixed(value.to_string()));
        self
    }

    pub fn one_of<I, S>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        let values = values.into_iter().map(|v| v.to_string()).collect();
        self.structure
            .fields
            .insert(key.to_string(), CapsValue::OneOf(values));
        self
    }

    pub fn build(self) -> Caps {
        Caps::List(vec![self.structure])
    }
}

/// The two ports of a stage. Sources have no sink port, sinks have no src port.
#[derive(Debug, Clone)]
pub struct Pads {
    pub sink: Option<Caps>,
    pub src: Option<Caps>,
}

impl Pads {
    pub fn source(src: Caps) -> Pads {
        Pads { sink: None, src: Some(src) }
    }

    pub fn filter(sink: Caps, src: Caps) -> Pads {
        Pads {
            sink: Some(sink),
            src: Some(src),
        }
    }

    pub fn sink(sink: Caps) -> Pads {
        Pads { sink: Some(sink), src: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(format: &str) -> Caps {
        Caps::builder("video/x-raw").field("format", format).build()
    }

    #[test]
    fn test_same_media_type_and_field_intersect() {
        assert!(raw("I420").can_intersect(&raw("I420")));
        assert!(!raw("I420").can_intersect(&raw("RGBA")));
    }

    #[test]
    fn test_one_of_narrows_to_common_value() {
        let accepts = Caps::builder("video/x-raw")
            .one_of("format", ["RGBA", "BGRA", "I420"])
            .build();
        let common = accepts.intersect(&raw("BGRA"));
        assert_eq!(common.structure().and_then(|s| s.get("format")), Some("BGRA"));
    }

    #[test]
    fn test_missing_field_is_unconstrained() {
        let rtp = Caps::builder("application/x-rtp")
            .field("encoding-name", "H264")
            .field("payload", 96)
            .build();
        let depay = Caps::builder("application/x-rtp")
            .field("encoding-name", "H264")
            .build();
        assert!(rtp.can_intersect(&depay));

        let h265 = Caps::builder("application/x-rtp")
            .field("encoding-name", "H265")
            .build();
        assert!(!rtp.can_intersect(&h265));
    }

    #[test]
    fn test_any_and_lists() {
        let h264 = Caps::builder("video/x-h264").build();
        assert!(h264.can_intersect(&Caps::any()));
        assert!(!h264.can_intersect(&Caps::empty()));

        let mux = Caps::builder("video/x-i420").build().merge(h264.clone());
        assert!(h264.can_intersect(&mux));
        assert!(!raw("I420").can_intersect(&mux));
    }

    #[test]
    fn test_display() {
        assert_eq!(raw("I420").to_string(), "video/x-raw, format=I420");
        assert_eq!(Caps::any().to_string(), "ANY");
    }
}
