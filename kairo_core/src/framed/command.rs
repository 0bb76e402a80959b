use super::boxes::CommandBox;
use crate::error::{ErrorKind, KairoError, Result};

/// Wire types an argument or response field can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Integer,
    Float,
    Boolean,
    Bytes,
    Text,
}

/// A decoded argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Bytes(Vec<u8>),
    Text(String),
}

impl ArgValue {
    fn kind(&self) -> ArgKind {
        match self {
            ArgValue::Integer(_) => ArgKind::Integer,
            ArgValue::Float(_) => ArgKind::Float,
            ArgValue::Boolean(_) => ArgKind::Boolean,
            ArgValue::Bytes(_) => ArgKind::Bytes,
            ArgValue::Text(_) => ArgKind::Text,
        }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            ArgValue::Integer(n) => n.to_string().into_bytes(),
            ArgValue::Float(x) => x.to_string().into_bytes(),
            ArgValue::Boolean(true) => b"True".to_vec(),
            ArgValue::Boolean(false) => b"False".to_vec(),
            ArgValue::Bytes(b) => b.clone(),
            ArgValue::Text(s) => s.clone().into_bytes(),
        }
    }

    fn decode(kind: ArgKind, raw: &[u8]) -> Result<ArgValue> {
        let text = || {
            std::str::from_utf8(raw).map_err(|_| {
                KairoError::ProtocolViolation("argument is not valid utf-8".to_string())
            })
        };
        match kind {
            ArgKind::Integer => Ok(ArgValue::Integer(text()?.parse().map_err(|_| {
                KairoError::ProtocolViolation(format!("bad integer {:?}", String::from_utf8_lossy(raw)))
            })?)),
            ArgKind::Float => Ok(ArgValue::Float(text()?.parse().map_err(|_| {
                KairoError::ProtocolViolation(format!("bad float {:?}", String::from_utf8_lossy(raw)))
            })?)),
            ArgKind::Boolean => match raw {
                b"True" => Ok(ArgValue::Boolean(true)),
                b"False" => Ok(ArgValue::Boolean(false)),
                _ => Err(KairoError::ProtocolViolation(format!(
                    "bad boolean {:?}",
                    String::from_utf8_lossy(raw)
                ))),
            },
            ArgKind::Bytes => Ok(ArgValue::Bytes(raw.to_vec())),
            ArgKind::Text => Ok(ArgValue::Text(text()?.to_string())),
        }
    }
}

/// An ordered collection of named argument values, used for both
/// requests and responses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArgList(Vec<(String, ArgValue)>);

impl ArgList {
    pub fn new() -> ArgList {
        ArgList(Vec::new())
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, value: ArgValue) -> ArgList {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: ArgValue) {
        if let Some(entry) = self.0.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
        } else {
            self.0.push((name.to_string(), value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_integer(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(ArgValue::Integer(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        match self.get(name) {
            Some(ArgValue::Float(x)) => Some(*x),
            _ => None,
        }
    }

    pub fn get_boolean(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(ArgValue::Boolean(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        match self.get(name) {
            Some(ArgValue::Bytes(b)) => Some(b.as_slice()),
            _ => None,
        }
    }

    pub fn get_text(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(ArgValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A command of the framed protocol: its name, typed request and
/// response schemas, and the mapping between wire error codes and
/// failure kinds.
///
/// Commands are declared as statics and registered with a dispatcher,
/// so lookup is a plain map over data rather than name reflection:
///
/// ```rust
/// use kairo_core::framed::{ArgKind, Command};
///
/// static SUM: Command = Command::new(
///     "Sum",
///     &[("a", ArgKind::Integer), ("b", ArgKind::Integer)],
///     &[("total", ArgKind::Integer)],
/// );
/// ```
#[derive(Debug)]
pub struct Command {
    pub name: &'static str,
    pub arguments: &'static [(&'static str, ArgKind)],
    pub response: &'static [(&'static str, ArgKind)],
    /// Wire code to failure-kind mapping for errors this command may
    /// transport.
    pub errors: &'static [(&'static str, ErrorKind)],
    /// Codes whose arrival terminates the connection after reporting.
    pub fatal_errors: &'static [&'static str],
    /// Hint that callers want no response box.
    pub requires_answer: bool,
}

impl Command {
    pub const fn new(
        name: &'static str,
        arguments: &'static [(&'static str, ArgKind)],
        response: &'static [(&'static str, ArgKind)],
    ) -> Command {
        Command {
            name,
            arguments,
            response,
            errors: &[],
            fatal_errors: &[],
            requires_answer: true,
        }
    }

    pub const fn with_errors(mut self, errors: &'static [(&'static str, ErrorKind)]) -> Command {
        self.errors = errors;
        self
    }

    pub const fn with_fatal_errors(mut self, fatal: &'static [&'static str]) -> Command {
        self.fatal_errors = fatal;
        self
    }

    pub const fn without_answer(mut self) -> Command {
        self.requires_answer = false;
        self
    }

    /// The wire code for a failure kind, if this command maps it.
    pub fn code_for_kind(&self, kind: ErrorKind) -> Option<&'static str> {
        self.errors
            .iter()
            .find(|(_, k)| kind.is(*k))
            .map(|(code, _)| *code)
    }

    /// The failure kind for a received wire code, if known.
    pub fn kind_for_code(&self, code: &str) -> Option<ErrorKind> {
        self.errors
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, k)| *k)
    }

    pub fn is_fatal_code(&self, code: &str) -> bool {
        self.fatal_errors.contains(&code)
    }

    fn encode_by_schema(
        &self,
        schema: &[(&'static str, ArgKind)],
        args: &ArgList,
        into: &mut CommandBox,
    ) -> Result<()> {
        for (name, kind) in schema {
            let Some(value) = args.get(name) else {
                return Err(KairoError::InvalidSignature(format!(
                    "forgot {} for {}",
                    name, self.name
                )));
            };
            if value.kind() != *kind {
                return Err(KairoError::InvalidSignature(format!(
                    "{} for {} should be {:?}",
                    name, self.name, kind
                )));
            }
            into.insert(name.as_bytes().to_vec(), value.encode());
        }
        Ok(())
    }

    fn decode_by_schema(
        schema: &[(&'static str, ArgKind)],
        cbox: &CommandBox,
    ) -> Result<ArgList> {
        let mut args = ArgList::new();
        for (name, kind) in schema {
            let Some(raw) = cbox.get(name.as_bytes()) else {
                return Err(KairoError::ProtocolViolation(format!(
                    "missing argument {}",
                    name
                )));
            };
            args.insert(name, ArgValue::decode(*kind, raw)?);
        }
        Ok(args)
    }

    /// Encode `args` into a request box (reserved keys added later by
    /// the protocol).
    pub fn encode_request(&self, args: &ArgList) -> Result<CommandBox> {
        let mut cbox = CommandBox::new();
        self.encode_by_schema(self.arguments, args, &mut cbox)?;
        Ok(cbox)
    }

    pub fn decode_request(&self, cbox: &CommandBox) -> Result<ArgList> {
        Command::decode_by_schema(self.arguments, cbox)
    }

    pub fn encode_response(&self, args: &ArgList) -> Result<CommandBox> {
        let mut cbox = CommandBox::new();
        self.encode_by_schema(self.response, args, &mut cbox)?;
        Ok(cbox)
    }

    pub fn decode_response(&self, cbox: &CommandBox) -> Result<ArgList> {
        Command::decode_by_schema(self.response, cbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static SUM: Command = Command::new(
        "Sum",
        &[("a", ArgKind::Integer), ("b", ArgKind::Integer)],
        &[("total", ArgKind::Integer)],
    );

    static DIVIDE: Command = Command::new(
        "Divide",
        &[("numerator", ArgKind::Integer), ("denominator", ArgKind::Integer)],
        &[("result", ArgKind::Float)],
    )
    .with_errors(&[("ZERO_DIVISION", ErrorKind::RemoteError)]);

    #[test]
    fn request_encoding_round_trips() {
        let args = ArgList::new()
            .with("a", ArgValue::Integer(13))
            .with("b", ArgValue::Integer(81));
        let cbox = SUM.encode_request(&args).unwrap();
        assert_eq!(cbox.get_str("a"), Some("13"));
        let back = SUM.decode_request(&cbox).unwrap();
        assert_eq!(back.get_integer("a"), Some(13));
        assert_eq!(back.get_integer("b"), Some(81));
    }

    #[test]
    fn missing_argument_is_an_invalid_signature() {
        let args = ArgList::new().with("a", ArgValue::Integer(1));
        assert!(matches!(
            SUM.encode_request(&args),
            Err(KairoError::InvalidSignature(_))
        ));
    }

    #[test]
    fn wrong_argument_type_is_an_invalid_signature() {
        let args = ArgList::new()
            .with("a", ArgValue::Text("one".to_string()))
            .with("b", ArgValue::Integer(2));
        assert!(matches!(
            SUM.encode_request(&args),
            Err(KairoError::InvalidSignature(_))
        ));
    }

    #[test]
    fn malformed_wire_argument_is_a_violation() {
        let mut cbox = CommandBox::new();
        cbox.insert("a", "not-a-number");
        cbox.insert("b", "2");
        assert!(matches!(
            SUM.decode_request(&cbox),
            Err(KairoError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn error_codes_map_both_ways() {
        assert_eq!(
            DIVIDE.kind_for_code("ZERO_DIVISION"),
            Some(ErrorKind::RemoteError)
        );
        assert_eq!(DIVIDE.kind_for_code("NOPE"), None);
        assert_eq!(
            DIVIDE.code_for_kind(ErrorKind::RemoteError),
            Some("ZERO_DIVISION")
        );
        assert_eq!(DIVIDE.code_for_kind(ErrorKind::Timeout), None);
    }

    #[test]
    fn boolean_and_bytes_encoding() {
        static FLAGS: Command = Command::new(
            "Flags",
            &[("on", ArgKind::Boolean), ("blob", ArgKind::Bytes)],
            &[],
        );
        let args = ArgList::new()
            .with("on", ArgValue::Boolean(true))
            .with("blob", ArgValue::Bytes(vec![0, 255, 7]));
        let cbox = FLAGS.encode_request(&args).unwrap();
        assert_eq!(cbox.get(b"on"), Some(b"True".as_slice()));
        let back = FLAGS.decode_request(&cbox).unwrap();
        assert_eq!(back.get_boolean("on"), Some(true));
        assert_eq!(back.get_bytes("blob"), Some([0, 255, 7].as_slice()));
    }
}
