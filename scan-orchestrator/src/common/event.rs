use std::fmt;

/// Identifies one reconcilable entity.
///
/// `hash_key` must be stable and unique per entity: the [`Queue`](super::Queue)
/// uses it to guarantee at most one in-flight reconciliation per entity.
pub trait ReconcileEvent: Clone + fmt::Display + Send + Sync + 'static {
    fn hash_key(&self) -> String;

    /// Key/value pairs attached to every log line of the reconciliation.
    fn labels(&self) -> Labels;
}

/// Ordered label set rendered as `key=value` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels(Vec<(&'static str, String)>);

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.0.push((key, value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

/// Declares an event type identifying an entity by a single id.
macro_rules! id_event {
    ($(#[$meta:meta])* $name:ident, $field:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub $field: String,
        }

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self { $field: id.into() }
            }
        }

        impl $crate::common::ReconcileEvent for $name {
            fn hash_key(&self) -> String {
                self.$field.clone()
            }

            fn labels(&self) -> $crate::common::Labels {
                $crate::common::Labels::new().with($label, self.$field.clone())
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, "{}={}", $label, self.$field)
            }
        }
    };
}

pub(crate) use id_event;

#[cfg(test)]
mod tests {
    use super::*;

    id_event!(
        /// Test event.
        SampleEvent,
        sample_id,
        "SampleID"
    );

    #[test]
    fn test_labels_display() {
        let labels = Labels::new().with("ScanID", "s-1").with("AssetID", "a-1");
        assert_eq!(labels.to_string(), "ScanID=s-1 AssetID=a-1");
        assert_eq!(labels.get("AssetID"), Some("a-1"));
        assert_eq!(labels.get("Missing"), None);
        assert_eq!(labels.iter().count(), 2);
    }

    #[test]
    fn test_id_event() {
        let event = SampleEvent::new("x");
        assert_eq!(event.hash_key(), "x");
        assert_eq!(event.to_string(), "SampleID=x");
        assert_eq!(event.labels().get("SampleID"), Some("x"));
    }
}
