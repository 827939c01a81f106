use crate::error::PoolError;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Parameter key that puts a driver connection into non-blocking mode.
pub const NONBLOCKING_KEY: &str = "async";

pub const DEFAULT_MAX_CONNECTIONS: usize = 10;

/// Driver connection parameters, an opaque key/value map handed to `Driver::connect`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams(BTreeMap<String, String>);

impl ConnectParams {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
    self.0.insert(key.into(), value.into());
    self
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self.0.get(key).map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Forces non-blocking mode. The pool only ever talks to drivers this way.
  pub fn force_nonblocking(&mut self) {
    self.0.insert(NONBLOCKING_KEY.to_string(), "1".to_string());
  }

  pub fn is_nonblocking(&self) -> bool {
    self.get(NONBLOCKING_KEY) == Some("1")
  }
}

impl FromStr for ConnectParams {
  type Err = PoolError;

  /// Parses a libpq-style DSN: whitespace separated `key=value` pairs, where a
  /// value may be single-quoted and use `\'` / `\\` escapes.
  fn from_str(dsn: &str) -> Result<Self, Self::Err> {
    let mut params = ConnectParams::new();
    let mut chars = dsn.chars().peekable();

    loop {
      while chars.next_if(|c| c.is_whitespace()).is_some() {}
      if chars.peek().is_none() {
        break;
      }

      let mut key = String::new();
      while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
        key.push(c);
      }
      while chars.next_if(|c| c.is_whitespace()).is_some() {}
      if chars.next() != Some('=') {
        return Err(PoolError::InvalidConfig(format!("missing '=' after DSN key '{}'", key)));
      }
      while chars.next_if(|c| c.is_whitespace()).is_some() {}

      let mut value = String::new();
      if chars.next_if_eq(&'\'').is_some() {
        let mut terminated = false;
        while let Some(c) = chars.next() {
          match c {
            '\\' => match chars.next() {
              Some(escaped) => value.push(escaped),
              None => break,
            },
            '\'' => {
              terminated = true;
              break;
            }
            other => value.push(other),
          }
        }
        if !terminated {
          return Err(PoolError::InvalidConfig(format!("unterminated quoted value for DSN key '{}'", key)));
        }
      } else {
        while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
          value.push(c);
        }
      }

      if key.is_empty() {
        return Err(PoolError::InvalidConfig("empty DSN key".to_string()));
      }
      params.set(key, value);
    }

    Ok(params)
  }
}

impl fmt::Display for ConnectParams {
  /// Renders the parameters back to DSN form, quoting values when needed.
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut first = true;
    for (key, value) in self.iter() {
      if !first {
        f.write_str(" ")?;
      }
      first = false;
      if value.is_empty() || value.contains(|c: char| c.is_whitespace() || c == '\'' || c == '\\') {
        let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
        write!(f, "{}='{}'", key, escaped)?;
      } else {
        write!(f, "{}={}", key, value)?;
      }
    }
    Ok(())
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConnectParams {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
  }
}

/// Configuration for a `ConnectionPool`, fixed at construction.
#[derive(Debug, Clone)]
pub struct PoolConfig {
  /// Name used in every log event emitted by the pool.
  pub name: String,
  /// Upper bound on connections leased or being established at once.
  pub max_connections: usize,
  pub connect_params: ConnectParams,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      name: "readypool".to_string(),
      max_connections: DEFAULT_MAX_CONNECTIONS,
      connect_params: ConnectParams::new(),
    }
  }
}

impl PoolConfig {
  pub fn new(max_connections: usize) -> Self {
    Self {
      max_connections,
      ..Default::default()
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn with_max_connections(mut self, max_connections: usize) -> Self {
    self.max_connections = max_connections;
    self
  }

  pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.connect_params.set(key, value);
    self
  }

  pub fn with_params(mut self, params: ConnectParams) -> Self {
    self.connect_params = params;
    self
  }

  /// Replaces the connection parameters with the ones parsed from `dsn`.
  pub fn with_dsn(mut self, dsn: &str) -> Result<Self, PoolError> {
    self.connect_params = dsn.parse()?;
    Ok(self)
  }

  pub fn validate(&self) -> Result<(), PoolError> {
    if self.max_connections == 0 {
      return Err(PoolError::InvalidConfig("max_connections must be positive".to_string()));
    }
    Ok(())
  }
}
