//! A byte-driven streaming XML tokenizer.
//!
//! The iSyntax header is a multi-hundred-megabyte XML document that is
//! read in fixed-size chunks; the tokenizer therefore consumes one byte
//! at a time and keeps all state across chunk boundaries. It follows the
//! yxml model: `push` returns a token code, and the caller reads the
//! current element name, attribute name, or data bytes from the
//! tokenizer's buffers.
//!
//! Only the XML subset that Philips emits is supported: elements,
//! double-/single-quoted attributes, character data, the five predefined
//! entities, numeric character references, comments, and processing
//! instructions.

use crate::error::{OpenError, bail, err};

/// Token codes surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Token {
    /// An element name is complete; read it with [`XmlTokenizer::elem_name`].
    ElemStart,
    /// The current element was closed (including self-closing elements).
    ElemEnd,
    /// An attribute name is complete; read it with [`XmlTokenizer::attr_name`].
    AttrStart,
    /// Decoded attribute value bytes are available in [`XmlTokenizer::data`].
    AttrVal,
    /// The current attribute value ended.
    AttrEnd,
    /// Decoded character data bytes are available in [`XmlTokenizer::data`].
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Character data between tags.
    Text,
    /// Just saw `<`.
    TagOpen,
    /// Inside `<?...?>`.
    Pi,
    /// Inside `<?...?` having seen a candidate closing `?`.
    PiMaybeEnd,
    /// Inside `<!...>` (DOCTYPE or similar), tracking nothing.
    Bang,
    /// Inside `<!--...-->`, with the number of consecutive dashes seen.
    Comment(u8),
    /// Accumulating an element name.
    ElemName,
    /// Accumulating a closing-tag name.
    CloseName,
    /// After a closing-tag name, waiting for `>`.
    CloseWait,
    /// Inside a start tag, between attributes.
    InTag,
    /// Saw `/` inside a start tag; expecting `>`.
    SelfClose,
    /// Accumulating an attribute name.
    AttrName,
    /// After an attribute name, waiting for `=`.
    AttrEq,
    /// After `=`, waiting for the opening quote.
    AttrQuote,
    /// Inside an attribute value delimited by the stored quote byte.
    AttrValue(u8),
}

pub(crate) struct XmlTokenizer {
    state: State,
    elem_name: String,
    attr_name: String,
    /// Decoded bytes for the current `Content`/`AttrVal` token.
    data: [u8; 4],
    data_len: usize,
    /// Pending entity bytes (without `&`), empty when not inside one.
    entity: Vec<u8>,
    in_entity: bool,
    /// Current element-nesting depth, used to reject unbalanced closing
    /// tags.
    depth: usize,
}

impl XmlTokenizer {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Text,
            elem_name: String::new(),
            attr_name: String::new(),
            data: [0; 4],
            data_len: 0,
            entity: Vec::new(),
            in_entity: false,
            depth: 0,
        }
    }

    /// Name of the most recently started element.
    pub(crate) fn elem_name(&self) -> &str {
        &self.elem_name
    }

    /// Name of the most recently started attribute.
    pub(crate) fn attr_name(&self) -> &str {
        &self.attr_name
    }

    /// Decoded bytes accompanying a `Content` or `AttrVal` token.
    pub(crate) fn data(&self) -> &[u8] {
        &self.data[..self.data_len]
    }

    /// True when the tokenizer sits in plain character data, i.e. the
    /// caller may bulk-skip bytes up to the next `<` without pushing them
    /// through the state machine.
    pub(crate) fn in_character_data(&self) -> bool {
        self.state == State::Text && !self.in_entity
    }

    #[inline]
    fn set_data(&mut self, bytes: &[u8]) {
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.data_len = bytes.len();
    }

    fn decode_entity(&mut self) -> Result<(), OpenError> {
        let mut buf = [0u8; 4];
        let decoded_len = match self.entity.as_slice() {
            b"amp" => {
                buf[0] = b'&';
                1
            }
            b"lt" => {
                buf[0] = b'<';
                1
            }
            b"gt" => {
                buf[0] = b'>';
                1
            }
            b"quot" => {
                buf[0] = b'"';
                1
            }
            b"apos" => {
                buf[0] = b'\'';
                1
            }
            other => {
                // Numeric character reference.
                let value = if let Some(hex) = other.strip_prefix(b"#x") {
                    u32::from_str_radix(str::from_utf8(hex).ok().unwrap_or(""), 16).ok()
                } else if let Some(dec) = other.strip_prefix(b"#") {
                    str::from_utf8(dec).ok().and_then(|s| s.parse::<u32>().ok())
                } else {
                    None
                };
                let Some(c) = value.and_then(char::from_u32) else {
                    bail!(OpenError::XmlMalformed("unknown entity"));
                };
                c.encode_utf8(&mut buf).len()
            }
        };
        self.entity.clear();
        self.in_entity = false;
        self.set_data_raw(buf, decoded_len);
        Ok(())
    }

    #[inline]
    fn set_data_raw(&mut self, bytes: [u8; 4], len: usize) {
        self.data = bytes;
        self.data_len = len;
    }

    /// Push one byte through the state machine.
    pub(crate) fn push(&mut self, c: u8) -> Result<Option<Token>, OpenError> {
        // Entities occur in character data and attribute values only.
        if self.in_entity {
            if c == b';' {
                self.decode_entity()?;
                return Ok(Some(match self.state {
                    State::AttrValue(_) => Token::AttrVal,
                    _ => Token::Content,
                }));
            }
            if self.entity.len() >= 10 {
                bail!(OpenError::XmlMalformed("oversized entity"));
            }
            self.entity.push(c);
            return Ok(None);
        }

        match self.state {
            State::Text => match c {
                b'<' => {
                    self.state = State::TagOpen;
                    Ok(None)
                }
                b'&' => {
                    self.in_entity = true;
                    Ok(None)
                }
                _ => {
                    self.set_data(&[c]);
                    Ok(Some(Token::Content))
                }
            },
            State::TagOpen => match c {
                b'?' => {
                    self.state = State::Pi;
                    Ok(None)
                }
                b'!' => {
                    self.state = State::Bang;
                    Ok(None)
                }
                b'/' => {
                    self.state = State::CloseName;
                    Ok(None)
                }
                c if c.is_ascii_whitespace() => {
                    err!(OpenError::XmlMalformed("whitespace after '<'"))
                }
                _ => {
                    self.elem_name.clear();
                    self.elem_name.push(c as char);
                    self.state = State::ElemName;
                    Ok(None)
                }
            },
            State::Pi => {
                if c == b'?' {
                    self.state = State::PiMaybeEnd;
                }
                Ok(None)
            }
            State::PiMaybeEnd => {
                self.state = if c == b'>' { State::Text } else { State::Pi };
                Ok(None)
            }
            State::Bang => match c {
                b'-' => {
                    self.state = State::Comment(0);
                    Ok(None)
                }
                b'>' => {
                    self.state = State::Text;
                    Ok(None)
                }
                _ => Ok(None),
            },
            State::Comment(dashes) => {
                match c {
                    b'-' => self.state = State::Comment((dashes + 1).min(2)),
                    b'>' if dashes >= 2 => self.state = State::Text,
                    _ => self.state = State::Comment(0),
                }
                Ok(None)
            }
            State::ElemName => match c {
                b'>' => {
                    self.state = State::Text;
                    self.depth += 1;
                    Ok(Some(Token::ElemStart))
                }
                b'/' => {
                    self.state = State::SelfClose;
                    self.depth += 1;
                    Ok(Some(Token::ElemStart))
                }
                c if c.is_ascii_whitespace() => {
                    self.state = State::InTag;
                    self.depth += 1;
                    Ok(Some(Token::ElemStart))
                }
                _ => {
                    self.elem_name.push(c as char);
                    Ok(None)
                }
            },
            State::CloseName => match c {
                b'>' => {
                    self.state = State::Text;
                    self.end_element()
                }
                c if c.is_ascii_whitespace() => {
                    self.state = State::CloseWait;
                    Ok(None)
                }
                _ => Ok(None),
            },
            State::CloseWait => match c {
                b'>' => {
                    self.state = State::Text;
                    self.end_element()
                }
                c if c.is_ascii_whitespace() => Ok(None),
                _ => err!(OpenError::XmlMalformed("junk in closing tag")),
            },
            State::InTag => match c {
                b'>' => {
                    self.state = State::Text;
                    Ok(None)
                }
                b'/' => {
                    self.state = State::SelfClose;
                    Ok(None)
                }
                c if c.is_ascii_whitespace() => Ok(None),
                _ => {
                    self.attr_name.clear();
                    self.attr_name.push(c as char);
                    self.state = State::AttrName;
                    Ok(None)
                }
            },
            State::SelfClose => match c {
                b'>' => {
                    self.state = State::Text;
                    self.end_element()
                }
                _ => err!(OpenError::XmlMalformed("expected '>' after '/'")),
            },
            State::AttrName => match c {
                b'=' => {
                    self.state = State::AttrQuote;
                    Ok(Some(Token::AttrStart))
                }
                c if c.is_ascii_whitespace() => {
                    self.state = State::AttrEq;
                    Ok(Some(Token::AttrStart))
                }
                _ => {
                    self.attr_name.push(c as char);
                    Ok(None)
                }
            },
            State::AttrEq => match c {
                b'=' => {
                    self.state = State::AttrQuote;
                    Ok(None)
                }
                c if c.is_ascii_whitespace() => Ok(None),
                _ => err!(OpenError::XmlMalformed("expected '=' after attribute")),
            },
            State::AttrQuote => match c {
                b'"' | b'\'' => {
                    self.state = State::AttrValue(c);
                    Ok(None)
                }
                c if c.is_ascii_whitespace() => Ok(None),
                _ => err!(OpenError::XmlMalformed("unquoted attribute value")),
            },
            State::AttrValue(quote) => match c {
                c if c == quote => {
                    self.state = State::InTag;
                    Ok(Some(Token::AttrEnd))
                }
                b'&' => {
                    self.in_entity = true;
                    Ok(None)
                }
                _ => {
                    self.set_data(&[c]);
                    Ok(Some(Token::AttrVal))
                }
            },
        }
    }

    fn end_element(&mut self) -> Result<Option<Token>, OpenError> {
        if self.depth == 0 {
            bail!(OpenError::XmlMalformed("closing element without start"));
        }
        self.depth -= 1;
        Ok(Some(Token::ElemEnd))
    }
}
