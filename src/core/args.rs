use crate::core::props::{PropertyType, PropertyValue};
use std::fmt;

/// `key=value` arguments of a filter, as given in its load string.
///
/// Arguments are separated by `:`; a doubled `::` stands for a literal colon
/// inside a value. An argument without `=` is a flag with no value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterArgs {
    args: Vec<(String, Option<String>)>,
}

impl FilterArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Self {
        let mut args = FilterArgs::new();
        for item in split_args(text) {
            if item.is_empty() {
                continue;
            }
            match item.split_once('=') {
                Some((key, value)) => args.push(key, Some(value)),
                None => args.push(&item, None),
            }
        }
        args
    }

    pub fn push(&mut self, key: &str, value: Option<&str>) {
        self.args
            .push((key.to_string(), value.map(str::to_string)));
    }

    /// Raw value of the last occurrence of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.args
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.args.iter().any(|(k, _)| k == key)
    }

    /// Parses the value of `key` as a property of type `ty`.
    ///
    /// # Returns
    /// `None` if the argument is absent; malformed values parse to the zero
    /// value of the type.
    pub fn get_value(
        &self,
        key: &str,
        ty: PropertyType,
        enum_values: Option<&str>,
    ) -> Option<PropertyValue> {
        if !self.contains(key) {
            return None;
        }
        Some(PropertyValue::parse(ty, key, self.get(key), enum_values))
    }

    /// Removes every occurrence of `key`, returning the last value.
    pub(crate) fn take(&mut self, key: &str) -> Option<Option<String>> {
        let mut found = None;
        self.args.retain(|(k, v)| {
            if k == key {
                found = Some(v.clone());
                false
            } else {
                true
            }
        });
        found
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.args.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }
}

impl fmt::Display for FilterArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            match v {
                Some(v) => write!(f, "{k}={}", v.replace(':', "::"))?,
                None => f.write_str(k)?,
            }
        }
        Ok(())
    }
}

fn split_args(text: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ':' {
            if chars.peek() == Some(&':') {
                chars.next();
                current.push(':');
            } else {
                items.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    items.push(current);
    items
}

/// Splits `name:args` into the register name and its arguments.
pub(crate) fn parse_load_string(text: &str) -> (String, FilterArgs) {
    let mut items = split_args(text.trim()).into_iter();
    let name = items.next().unwrap_or_default();
    let rest: Vec<String> = items.map(|s| s.replace(':', "::")).collect();
    (name, FilterArgs::parse(&rest.join(":")))
}
