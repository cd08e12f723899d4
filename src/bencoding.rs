use std::collections::HashMap;
use std::fmt;

use anyhow::{bail, Result};

use crate::util::force_string;

#[derive(PartialEq, Debug, Clone)]
pub enum Value {
    Str(Vec<u8>),
    Int(i64),
    List(Vec<Value>),
    Dict(HashMap<Vec<u8>, Value>, usize, usize), // entries, start and end offset of the dict in the source
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "\"{}\"", force_string(s)),
            Value::Int(i) => write!(f, "{i}"),
            Value::List(l) => {
                let items: Vec<String> = l.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Value::Dict(d, _, _) => {
                let mut keys: Vec<&Vec<u8>> = d.keys().collect();
                keys.sort();
                let items: Vec<String> = keys
                    .into_iter()
                    .map(|k| format!("{}: {}", force_string(k), d[k]))
                    .collect();
                write!(f, "{{{}}}", items.join(", "))
            }
        }
    }
}

impl Value {
    /// Decodes a whole buffer, trailing bytes are an error.
    pub fn decode(source: &[u8]) -> Result<Self> {
        let (value, end) = Self::decode_prefix(source)?;
        if end != source.len() {
            bail!(
                "unexpected trailing data at offset {end} ({} bytes)",
                source.len() - end
            );
        }
        Ok(value)
    }

    /// Decodes the first value of the buffer and returns it with the offset
    /// just past it.
    pub fn decode_prefix(source: &[u8]) -> Result<(Self, usize)> {
        Parser { source, depth: 0 }.parse(0)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Str(s) => {
                buf.extend_from_slice(s.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(s);
            }
            Value::Int(i) => {
                buf.push(b'i');
                buf.extend_from_slice(i.to_string().as_bytes());
                buf.push(b'e');
            }
            Value::List(l) => {
                buf.push(b'l');
                l.iter().for_each(|v| v.encode_into(buf));
                buf.push(b'e');
            }
            Value::Dict(d, _, _) => {
                // keys must be sorted as raw strings
                let mut keys: Vec<&Vec<u8>> = d.keys().collect();
                keys.sort();
                buf.push(b'd');
                for k in keys {
                    Value::Str(k.clone()).encode_into(buf);
                    d[k].encode_into(buf);
                }
                buf.push(b'e');
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Value::Dict(d, _, _) => d.get(key),
            _ => None,
        }
    }
}

const MAX_DEPTH: usize = 64;

struct Parser<'a> {
    source: &'a [u8],
    depth: usize,
}

impl Parser<'_> {
    // returns the value and the index of the next byte to read
    fn parse(&mut self, index: usize) -> Result<(Value, usize)> {
        match self.source.get(index) {
            Some(b'0'..=b'9') => self.parse_str(index),
            Some(b'i') => self.parse_int(index),
            Some(b'l') | Some(b'd') => {
                self.depth += 1;
                if self.depth > MAX_DEPTH {
                    bail!("nesting deeper than {MAX_DEPTH} at offset {index}");
                }
                let parsed = if self.source[index] == b'l' {
                    self.parse_list(index)
                } else {
                    self.parse_dict(index)
                };
                self.depth -= 1;
                parsed
            }
            Some(c) => bail!("unexpected byte {c:#04x} at offset {index}"),
            None => bail!("unexpected end of data at offset {index}"),
        }
    }

    fn parse_str(&mut self, index: usize) -> Result<(Value, usize)> {
        let colon = match self.source[index..].iter().position(|c| *c == b':') {
            Some(p) => index + p,
            None => bail!("string length at offset {index} is not terminated"),
        };
        let len_str = &self.source[index..colon];
        if !len_str.iter().all(u8::is_ascii_digit) {
            bail!("invalid string length at offset {index}");
        }
        let len: usize = std::str::from_utf8(len_str)?.parse()?;
        let start = colon + 1;
        let end = match start.checked_add(len) {
            Some(end) if end <= self.source.len() => end,
            _ => bail!("string at offset {index} runs past the end of data"),
        };
        Ok((Value::Str(self.source[start..end].to_vec()), end))
    }

    fn parse_int(&mut self, index: usize) -> Result<(Value, usize)> {
        let end = match self.source[index..].iter().position(|c| *c == b'e') {
            Some(p) => index + p,
            None => bail!("integer at offset {index} is not terminated"),
        };
        let digits = std::str::from_utf8(&self.source[index + 1..end])?;
        let valid = match digits.strip_prefix('-') {
            Some(d) => !d.is_empty() && !d.starts_with('0') && d.bytes().all(|c| c.is_ascii_digit()),
            None => {
                !digits.is_empty()
                    && (digits == "0" || !digits.starts_with('0'))
                    && digits.bytes().all(|c| c.is_ascii_digit())
            }
        };
        if !valid {
            bail!("invalid integer \"{digits}\" at offset {index}");
        }
        Ok((Value::Int(digits.parse()?), end + 1))
    }

    fn parse_list(&mut self, index: usize) -> Result<(Value, usize)> {
        let mut list = Vec::new();
        let mut next = index + 1;
        loop {
            if self.source.get(next) == Some(&b'e') {
                return Ok((Value::List(list), next + 1));
            }
            let (v, n) = self.parse(next)?;
            list.push(v);
            next = n;
        }
    }

    fn parse_dict(&mut self, index: usize) -> Result<(Value, usize)> {
        let mut dict = HashMap::new();
        let mut next = index + 1;
        loop {
            if self.source.get(next) == Some(&b'e') {
                return Ok((Value::Dict(dict, index, next + 1), next + 1));
            }
            let key = match self.parse(next)? {
                (Value::Str(k), n) => {
                    next = n;
                    k
                }
                _ => bail!("dictionary key at offset {next} is not a string"),
            };
            let (v, n) = self.parse(next)?;
            dict.insert(key, v);
            next = n;
        }
    }
}
