//! Frame values and their bracketed text form.
//!
//! ```text
//! [FOO[IS-A[VALUE BAR]][SLOT[VALUE 42][DEFAULT 0]]]
//!  ^^^ ^^^^ ^^^^^ ^^^
//!  name slot facet filler
//! ```
//!
//! Fillers are whitespace-separated atoms. This is only the subset of
//! the frame language the protocol needs to carry frame bodies around.

use std::fmt;

use crate::protocol::ErrorCode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Facet {
    pub name: String,
    pub fillers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub name: String,
    pub facets: Vec<Facet>,
}

impl Slot {
    fn facet(&self, name: &str) -> Option<&Facet> {
        self.facets.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    name: String,
    slots: Vec<Slot>,
}

impl Frame {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot(&self, name: &str) -> Option<&Slot> {
        self.slots.iter().find(|s| s.name == name)
    }

    /// Fillers of `slot`/`facet`. `None` when the slot does not exist;
    /// an existing slot without the facet yields an empty list.
    pub fn fillers(&self, slot: &str, facet: &str) -> Option<&[String]> {
        let slot = self.slot(slot)?;
        Some(slot.facet(facet).map_or(&[][..], |f| f.fillers.as_slice()))
    }

    /// Names of the facets present on `slot`.
    pub fn facet_names(&self, slot: &str) -> Vec<&str> {
        self.slot(slot)
            .map(|s| s.facets.iter().map(|f| f.name.as_str()).collect())
            .unwrap_or_default()
    }

    /// Add a filler, creating slot and facet as needed. Returns false if
    /// the filler was already present.
    pub fn add_filler(&mut self, slot: &str, facet: &str, filler: &str) -> bool {
        let slot = match self.slots.iter().position(|s| s.name == slot) {
            Some(i) => &mut self.slots[i],
            None => {
                self.slots.push(Slot {
                    name: slot.to_string(),
                    facets: Vec::new(),
                });
                let last = self.slots.len() - 1;
                &mut self.slots[last]
            }
        };
        let facet = match slot.facets.iter().position(|f| f.name == facet) {
            Some(i) => &mut slot.facets[i],
            None => {
                slot.facets.push(Facet {
                    name: facet.to_string(),
                    fillers: Vec::new(),
                });
                let last = slot.facets.len() - 1;
                &mut slot.facets[last]
            }
        };
        if facet.fillers.iter().any(|f| f == filler) {
            return false;
        }
        facet.fillers.push(filler.to_string());
        true
    }

    /// Remove a filler. Returns false if it was not there.
    pub fn erase_filler(&mut self, slot: &str, facet: &str, filler: &str) -> bool {
        let Some(slot) = self.slots.iter_mut().find(|s| s.name == slot) else {
            return false;
        };
        let Some(facet) = slot.facets.iter_mut().find(|f| f.name == facet) else {
            return false;
        };
        let before = facet.fillers.len();
        facet.fillers.retain(|f| f != filler);
        facet.fillers.len() != before
    }

    /// Parse the bracketed text form.
    pub fn parse(text: &str) -> Result<Self, ErrorCode> {
        let mut tokens = Tokenizer::new(text);
        let frame = parse_frame(&mut tokens)?;
        match tokens.next() {
            None => Ok(frame),
            Some(_) => Err(ErrorCode::InvalidParameters),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.name)?;
        for slot in &self.slots {
            write!(f, "[{}", slot.name)?;
            for facet in &slot.facets {
                write!(f, "[{}", facet.name)?;
                for filler in &facet.fillers {
                    write!(f, " {}", filler)?;
                }
                f.write_str("]")?;
            }
            f.write_str("]")?;
        }
        f.write_str("]")
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Open,
    Close,
    Atom(&'a str),
}

struct Tokenizer<'a> {
    rest: &'a str,
}

impl<'a> Tokenizer<'a> {
    fn new(text: &'a str) -> Self {
        Self { rest: text }
    }
}

impl<'a> Iterator for Tokenizer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        self.rest = self.rest.trim_start();
        let mut chars = self.rest.chars();
        let token = match chars.next()? {
            '[' => Token::Open,
            ']' => Token::Close,
            _ => {
                let end = self
                    .rest
                    .find(|c: char| c.is_whitespace() || c == '[' || c == ']')
                    .unwrap_or(self.rest.len());
                let atom = &self.rest[..end];
                self.rest = &self.rest[end..];
                return Some(Token::Atom(atom));
            }
        };
        self.rest = chars.as_str();
        Some(token)
    }
}

fn expect_open_name<'a>(tokens: &mut Tokenizer<'a>) -> Result<&'a str, ErrorCode> {
    match (tokens.next(), tokens.next()) {
        (Some(Token::Open), Some(Token::Atom(name))) => Ok(name),
        _ => Err(ErrorCode::InvalidParameters),
    }
}

fn parse_frame(tokens: &mut Tokenizer<'_>) -> Result<Frame, ErrorCode> {
    let mut frame = Frame::new(expect_open_name(tokens)?);
    loop {
        match peek(tokens) {
            Some(Token::Close) => {
                tokens.next();
                return Ok(frame);
            }
            Some(Token::Open) => frame.slots.push(parse_slot(tokens)?),
            _ => return Err(ErrorCode::InvalidParameters),
        }
    }
}

fn parse_slot(tokens: &mut Tokenizer<'_>) -> Result<Slot, ErrorCode> {
    let mut slot = Slot {
        name: expect_open_name(tokens)?.to_string(),
        facets: Vec::new(),
    };
    loop {
        match peek(tokens) {
            Some(Token::Close) => {
                tokens.next();
                return Ok(slot);
            }
            Some(Token::Open) => slot.facets.push(parse_facet(tokens)?),
            _ => return Err(ErrorCode::InvalidParameters),
        }
    }
}

fn parse_facet(tokens: &mut Tokenizer<'_>) -> Result<Facet, ErrorCode> {
    let mut facet = Facet {
        name: expect_open_name(tokens)?.to_string(),
        fillers: Vec::new(),
    };
    loop {
        match tokens.next() {
            Some(Token::Close) => return Ok(facet),
            Some(Token::Atom(atom)) => facet.fillers.push(atom.to_string()),
            _ => return Err(ErrorCode::InvalidParameters),
        }
    }
}

fn peek<'a>(tokens: &Tokenizer<'a>) -> Option<Token<'a>> {
    Tokenizer { rest: tokens.rest }.next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print() {
        let mut frame = Frame::new("FOO");
        frame.add_filler("SLOT", "VALUE", "42");
        assert_eq!(frame.to_string(), "[FOO[SLOT[VALUE 42]]]");
        assert_eq!(Frame::new("EMPTY").to_string(), "[EMPTY]");
    }

    #[test]
    fn test_parse_nested() {
        let frame = Frame::parse("[DOG [IS-A [VALUE ANIMAL PET]] [LEGS [VALUE 4] [SEM NUMBER]]]").unwrap();
        assert_eq!(frame.name(), "DOG");
        assert_eq!(frame.fillers("IS-A", "VALUE").unwrap(), ["ANIMAL", "PET"]);
        assert_eq!(frame.fillers("LEGS", "SEM").unwrap(), ["NUMBER"]);
        assert!(frame.fillers("LEGS", "DEFAULT").unwrap().is_empty());
        assert!(frame.fillers("TAIL", "VALUE").is_none());
        assert_eq!(frame.facet_names("LEGS"), vec!["VALUE", "SEM"]);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for text in ["", "FOO", "[FOO", "[FOO]]", "[FOO[SLOT 1]]", "[[X]]", "[FOO[S[F a]]"] {
            assert_eq!(Frame::parse(text), Err(ErrorCode::InvalidParameters), "{:?}", text);
        }
    }

    #[test]
    fn test_add_and_erase_fillers() {
        let mut frame = Frame::new("X");
        assert!(frame.add_filler("S", "VALUE", "a"));
        assert!(!frame.add_filler("S", "VALUE", "a"));
        assert!(frame.add_filler("S", "VALUE", "b"));
        assert!(frame.erase_filler("S", "VALUE", "a"));
        assert!(!frame.erase_filler("S", "VALUE", "a"));
        assert!(!frame.erase_filler("T", "VALUE", "a"));
        assert_eq!(frame.to_string(), "[X[S[VALUE b]]]");
        assert_eq!(Frame::parse(&frame.to_string()).unwrap(), frame);
    }
}
