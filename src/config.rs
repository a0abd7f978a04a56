//! Parser for the hierarchical service-configuration text format described in SPEC_FULL.md §6.
//!
//! Grounded in the original program's `conf.c`, which builds a `conf_svc` by walking a
//! `libconfig`-parsed tree and validating each setting. There is no idiomatic Rust binding for
//! that exact grammar in the surrounding crate corpus, so this module hand-rolls a small
//! recursive-descent parser for the same shape (`key = value;`, `( ... )` lists, `{ ... }`
//! groups) rather than pull in an unrelated format (TOML/YAML) that would silently change the
//! file format this system reads.

use std::fmt;
use std::fs;
use std::path::Path;

use nix::sys::signal::Signal;

use crate::descriptor::{
    Argv, ServiceDescriptor, SVC_ARG_MAX, SVC_DESC_MAX, SVC_ENV_NAME_MAX, SVC_ENV_VALUE_MAX,
    SVC_NAME_MAX,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub path: String,
    pub reason: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}': {}", self.path, self.reason)
    }
}

impl std::error::Error for ConfigError {}

type PResult<T> = Result<T, String>;

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Int(i64),
    List(Vec<Value>),
    Group(Vec<(String, Value)>),
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Eq,
    Semi,
    Comma,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Eof,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            while self.pos < self.src.len() && (self.src[self.pos] as char).is_whitespace() {
                self.pos += 1;
            }
            if self.pos < self.src.len() && self.src[self.pos] == b'#' {
                while self.pos < self.src.len() && self.src[self.pos] != b'\n' {
                    self.pos += 1;
                }
                continue;
            }
            if self.pos + 1 < self.src.len()
                && self.src[self.pos] == b'/'
                && self.src[self.pos + 1] == b'/'
            {
                while self.pos < self.src.len() && self.src[self.pos] != b'\n' {
                    self.pos += 1;
                }
                continue;
            }
            break;
        }
    }

    fn next(&mut self) -> PResult<Token> {
        self.skip_trivia();
        if self.pos >= self.src.len() {
            return Ok(Token::Eof);
        }
        let c = self.src[self.pos] as char;
        match c {
            '=' => {
                self.pos += 1;
                Ok(Token::Eq)
            }
            ';' => {
                self.pos += 1;
                Ok(Token::Semi)
            }
            ',' => {
                self.pos += 1;
                Ok(Token::Comma)
            }
            '(' => {
                self.pos += 1;
                Ok(Token::LParen)
            }
            ')' => {
                self.pos += 1;
                Ok(Token::RParen)
            }
            '{' => {
                self.pos += 1;
                Ok(Token::LBrace)
            }
            '}' => {
                self.pos += 1;
                Ok(Token::RBrace)
            }
            '"' => self.lex_string(),
            c if c.is_ascii_digit() || c == '-' => self.lex_int(),
            c if c.is_ascii_alphabetic() || c == '_' => self.lex_ident(),
            other => Err(format!("unexpected character '{other}'")),
        }
    }

    fn lex_string(&mut self) -> PResult<Token> {
        self.pos += 1;
        let start = self.pos;
        while self.pos < self.src.len() && self.src[self.pos] != b'"' {
            self.pos += 1;
        }
        if self.pos >= self.src.len() {
            return Err("unterminated string literal".to_owned());
        }
        let s = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| "invalid utf-8 in string literal".to_owned())?
            .to_owned();
        self.pos += 1;
        Ok(Token::Str(s))
    }

    fn lex_int(&mut self) -> PResult<Token> {
        let start = self.pos;
        if self.src[self.pos] == b'-' {
            self.pos += 1;
        }
        while self.pos < self.src.len() && (self.src[self.pos] as char).is_ascii_digit() {
            self.pos += 1;
        }
        let s = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        s.parse::<i64>()
            .map(Token::Int)
            .map_err(|_| format!("invalid integer literal '{s}'"))
    }

    fn lex_ident(&mut self) -> PResult<Token> {
        let start = self.pos;
        while self.pos < self.src.len() {
            let c = self.src[self.pos] as char;
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let s = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        Ok(Token::Ident(s.to_owned()))
    }
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    peeked: Option<Token>,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Parser {
            lexer: Lexer::new(src),
            peeked: None,
        }
    }

    fn peek(&mut self) -> PResult<Token> {
        if self.peeked.is_none() {
            self.peeked = Some(self.lexer.next()?);
        }
        Ok(self.peeked.clone().unwrap())
    }

    fn bump(&mut self) -> PResult<Token> {
        if let Some(t) = self.peeked.take() {
            return Ok(t);
        }
        self.lexer.next()
    }

    fn expect(&mut self, want: &Token) -> PResult<()> {
        let got = self.bump()?;
        if &got == want {
            Ok(())
        } else {
            Err(format!("expected {want:?}, found {got:?}"))
        }
    }

    /// Parses the top-level `key = value;` sequence.
    fn parse_top(&mut self) -> PResult<Vec<(String, Value)>> {
        let mut settings = Vec::new();
        loop {
            if self.peek()? == Token::Eof {
                break;
            }
            let key = match self.bump()? {
                Token::Ident(s) => s,
                other => return Err(format!("expected setting name, found {other:?}")),
            };
            self.expect(&Token::Eq)?;
            let value = self.parse_value()?;
            self.expect(&Token::Semi)?;
            settings.push((key, value));
        }
        Ok(settings)
    }

    fn parse_value(&mut self) -> PResult<Value> {
        match self.peek()? {
            Token::Str(_) => {
                if let Token::Str(s) = self.bump()? {
                    Ok(Value::Str(s))
                } else {
                    unreachable!()
                }
            }
            Token::Int(_) => {
                if let Token::Int(n) = self.bump()? {
                    Ok(Value::Int(n))
                } else {
                    unreachable!()
                }
            }
            Token::LParen => {
                self.bump()?;
                let mut items = Vec::new();
                if self.peek()? != Token::RParen {
                    loop {
                        items.push(self.parse_value()?);
                        if self.peek()? == Token::Comma {
                            self.bump()?;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Token::RParen)?;
                Ok(Value::List(items))
            }
            Token::LBrace => {
                self.bump()?;
                let mut fields = Vec::new();
                while self.peek()? != Token::RBrace {
                    let key = match self.bump()? {
                        Token::Ident(s) => s,
                        other => return Err(format!("expected field name, found {other:?}")),
                    };
                    self.expect(&Token::Eq)?;
                    let value = self.parse_value()?;
                    self.expect(&Token::Semi)?;
                    fields.push((key, value));
                }
                self.expect(&Token::RBrace)?;
                Ok(Value::Group(fields))
            }
            other => Err(format!("unexpected token {other:?} in value position")),
        }
    }
}

fn is_printable(s: &str) -> bool {
    s.bytes().all(|b| (0x20..0x7f).contains(&b))
}

fn as_str(v: &Value) -> PResult<&str> {
    match v {
        Value::Str(s) => Ok(s.as_str()),
        _ => Err("expected a string".to_owned()),
    }
}

fn as_list<'a>(v: &'a Value) -> PResult<&'a [Value]> {
    match v {
        Value::List(l) => Ok(l.as_slice()),
        _ => Err("expected a list".to_owned()),
    }
}

fn as_group<'a>(v: &'a Value) -> PResult<&'a [(String, Value)]> {
    match v {
        Value::Group(g) => Ok(g.as_slice()),
        _ => Err("expected a group".to_owned()),
    }
}

fn as_int(v: &Value) -> PResult<i64> {
    match v {
        Value::Int(n) => Ok(*n),
        _ => Err("expected an integer".to_owned()),
    }
}

/// Public validity check for a bare name (service or target) against the same charset rule
/// `parse_name` enforces while loading descriptors; used by the target walk to validate
/// `target_name` before it is joined onto a filesystem path.
pub fn is_valid_name(raw: &str) -> bool {
    parse_name(raw).is_ok()
}

fn parse_name(raw: &str) -> PResult<()> {
    if raw.is_empty() {
        return Err("name must not be empty".to_owned());
    }
    if raw.len() >= SVC_NAME_MAX {
        return Err(format!("name too long (limit {})", SVC_NAME_MAX - 1));
    }
    let bytes = raw.as_bytes();
    let ok_edge = |b: u8| (b as char).is_ascii_alphanumeric();
    let ok_mid = |b: u8| (b as char).is_ascii_alphanumeric() || b"._@-".contains(&b);
    if !ok_edge(bytes[0]) || !ok_edge(bytes[bytes.len() - 1]) {
        return Err("name must start and end with an alphanumeric character".to_owned());
    }
    if !bytes.iter().all(|&b| ok_mid(b)) {
        return Err("name contains an invalid character".to_owned());
    }
    Ok(())
}

fn parse_name_list(v: &Value, field: &str, owner: &str) -> PResult<Vec<String>> {
    let items = as_list(v)?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let name = as_str(item)?.to_owned();
        parse_name(&name).map_err(|e| format!("{field}: {e}"))?;
        if name == owner {
            return Err(format!("{field} must not reference the service's own name"));
        }
        if out.contains(&name) {
            return Err(format!("{field} contains a duplicate entry '{name}'"));
        }
        out.push(name);
    }
    Ok(out)
}

fn parse_argv(v: &Value) -> PResult<Argv> {
    let items = as_list(v)?;
    if items.is_empty() {
        return Err("command must have at least one argument".to_owned());
    }
    let mut argv = Vec::with_capacity(items.len());
    for item in items {
        let arg = as_str(item)?;
        if arg.len() >= SVC_ARG_MAX {
            return Err(format!("argument exceeds {} bytes", SVC_ARG_MAX - 1));
        }
        if !is_printable(arg) {
            return Err("argument contains a non-printable byte".to_owned());
        }
        argv.push(arg.to_owned());
    }
    Ok(argv)
}

fn parse_cmd_seq(v: &Value) -> PResult<Vec<Argv>> {
    let items = as_list(v)?;
    // Accept both a single flat command `( "a", "b" )` and a sequence of commands
    // `( ( "a" ), ( "b", "c" ) )`; the original format disambiguates by item type.
    if items.iter().all(|i| matches!(i, Value::Str(_))) {
        return Ok(vec![parse_argv(v)?]);
    }
    let mut seq = Vec::with_capacity(items.len());
    for item in items {
        seq.push(parse_argv(item)?);
    }
    Ok(seq)
}

fn parse_signal(n: i64, field: &str) -> PResult<Signal> {
    Signal::try_from(n as i32).map_err(|_| format!("{field}: invalid signal number {n}"))
}

/// Parses a single `.conf` file's contents into a [`ServiceDescriptor`].
pub fn parse(origin: &str, text: &str) -> Result<ServiceDescriptor, ConfigError> {
    parse_inner(origin, text).map_err(|reason| ConfigError {
        path: origin.to_owned(),
        reason,
    })
}

fn parse_inner(origin: &str, text: &str) -> PResult<ServiceDescriptor> {
    let settings = Parser::new(text).parse_top()?;

    let mut name = None;
    let mut description = None;
    let mut stdin = None;
    let mut stdout = None;
    let mut environ = Vec::new();
    let mut start_cmds = Vec::new();
    let mut daemon = None;
    let mut stop_cmds = Vec::new();
    let mut stop_sig = Signal::SIGTERM;
    let mut reload_sig = Signal::SIGTERM;
    let mut starton_raw = None;
    let mut stopon_raw = None;

    for (key, value) in &settings {
        match key.as_str() {
            "name" => {
                let n = as_str(value)?.to_owned();
                parse_name(&n)?;
                name = Some(n);
            }
            "description" => {
                let d = as_str(value)?;
                if d.len() > SVC_DESC_MAX || !is_printable(d) {
                    return Err("description invalid".to_owned());
                }
                description = Some(d.to_owned());
            }
            "stdin" => {
                let p = as_str(value)?;
                if !p.starts_with("/dev/") || !is_printable(p) {
                    return Err("stdin must be a path under /dev/".to_owned());
                }
                stdin = Some(p.to_owned());
            }
            "stdout" => {
                let p = as_str(value)?;
                if !is_printable(p) {
                    return Err("stdout path invalid".to_owned());
                }
                stdout = Some(p.to_owned());
            }
            "environ" => {
                for (k, v) in as_group(value)? {
                    if k.len() >= SVC_ENV_NAME_MAX
                        || !k
                            .bytes()
                            .enumerate()
                            .all(|(i, b)| {
                                let c = b as char;
                                if i == 0 {
                                    c.is_ascii_uppercase() || c == '_'
                                } else {
                                    c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_'
                                }
                            })
                    {
                        return Err(format!("environ: invalid variable name '{k}'"));
                    }
                    let val = as_str(v)?;
                    if val.len() >= SVC_ENV_VALUE_MAX || !is_printable(val) {
                        return Err(format!("environ: invalid value for '{k}'"));
                    }
                    environ.push((k.clone(), val.to_owned()));
                }
            }
            "start" => start_cmds = parse_cmd_seq(value)?,
            "stop" => stop_cmds = parse_cmd_seq(value)?,
            "daemon" => daemon = Some(parse_argv(value)?),
            "starton" => starton_raw = Some(value.clone()),
            "stopon" => stopon_raw = Some(value.clone()),
            "signal.stop" => stop_sig = parse_signal(as_int(value)?, "signal.stop")?,
            "signal.reload" => reload_sig = parse_signal(as_int(value)?, "signal.reload")?,
            "signal" => {
                for (k, v) in as_group(value)? {
                    match k.as_str() {
                        "stop" => stop_sig = parse_signal(as_int(v)?, "signal.stop")?,
                        "reload" => reload_sig = parse_signal(as_int(v)?, "signal.reload")?,
                        other => {
                            tracing::warn!("'{origin}': skipping unrecognized signal.{other}")
                        }
                    }
                }
            }
            other => tracing::warn!("'{origin}': skipping unrecognized setting '{other}'"),
        }
    }

    let name = name.ok_or_else(|| "missing required 'name' setting".to_owned())?;
    let starton = match starton_raw {
        Some(v) => parse_name_list(&v, "starton", &name)?,
        None => Vec::new(),
    };
    let stopon = match stopon_raw {
        Some(v) => parse_name_list(&v, "stopon", &name)?,
        None => Vec::new(),
    };

    let descriptor = ServiceDescriptor {
        name,
        origin: origin.to_owned(),
        description,
        stdin,
        stdout,
        environ,
        start_cmds,
        daemon,
        stop_cmds,
        stop_sig,
        reload_sig,
        starton,
        stopon,
    };

    if !descriptor.has_action() {
        return Err("must define at least one of start, stop, or daemon".to_owned());
    }

    Ok(descriptor)
}

/// Reads and parses a single `.conf` file from disk.
pub fn load_file(path: &Path) -> Result<ServiceDescriptor, ConfigError> {
    let origin = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());
    let text = fs::read_to_string(path).map_err(|e| ConfigError {
        path: origin.clone(),
        reason: e.to_string(),
    })?;
    parse(&origin, &text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_daemon() {
        let src = r#"
            name = "echo";
            daemon = ( "/bin/sleep", "3600" );
        "#;
        let d = parse("echo.conf", src).unwrap();
        assert_eq!(d.name, "echo");
        assert_eq!(d.daemon.unwrap(), vec!["/bin/sleep", "3600"]);
        assert_eq!(d.stop_sig, Signal::SIGTERM);
    }

    #[test]
    fn parses_full_descriptor() {
        let src = r#"
            name = "web";
            description = "web server";
            stdin = "/dev/null";
            stdout = "/dev/console";
            environ = { PORT = "8080"; MODE = "prod"; };
            starton = ( "net" );
            start = ( ( "/bin/mkdir", "-p", "/run/web" ) );
            stop = ( ( "/bin/kill", "-TERM" ) );
            daemon = ( "/usr/bin/webd", "--foreground" );
            signal = { stop = 15; reload = 1; };
        "#;
        let d = parse("web.conf", src).unwrap();
        assert_eq!(d.environ.len(), 2);
        assert_eq!(d.starton, vec!["net"]);
        assert_eq!(d.start_cmds.len(), 1);
        assert_eq!(d.reload_sig, Signal::SIGHUP);
    }

    #[test]
    fn rejects_missing_name() {
        let src = r#"daemon = ( "/bin/sleep", "1" );"#;
        assert!(parse("bad.conf", src).is_err());
    }

    #[test]
    fn rejects_missing_action() {
        let src = r#"name = "idle";"#;
        assert!(parse("idle.conf", src).is_err());
    }

    #[test]
    fn rejects_self_referential_starton() {
        let src = r#"
            name = "a";
            daemon = ( "/bin/true" );
            starton = ( "a" );
        "#;
        assert!(parse("a.conf", src).is_err());
    }

    #[test]
    fn rejects_oversized_name() {
        let long_name = "a".repeat(SVC_NAME_MAX);
        let src = format!(r#"name = "{long_name}"; daemon = ( "/bin/true" );"#);
        assert!(parse("long.conf", &src).is_err());
    }

    #[test]
    fn rejects_nonprintable_argument() {
        let src = "name = \"a\";\ndaemon = ( \"/bin/true\", \"bad\u{0007}arg\" );";
        assert!(parse("a.conf", src).is_err());
    }
}
