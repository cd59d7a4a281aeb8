//! Tokenizer and recursive-descent parser for the schema DSL.

use super::{Arity, DefaultValue, EnumDef, Field, FieldType, Model, Relation, ScalarType, Schema};
use crate::error::{CoreError, CoreResult};
use crate::sql::quote_literal;

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Number(String),
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Question,
    Equals,
    At,
    AtAt,
    Newline,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
}

fn tokenize(source: &str) -> CoreResult<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let simple = match c {
            '{' => Some(Tok::LBrace),
            '}' => Some(Tok::RBrace),
            '(' => Some(Tok::LParen),
            ')' => Some(Tok::RParen),
            '[' => Some(Tok::LBracket),
            ']' => Some(Tok::RBracket),
            ',' => Some(Tok::Comma),
            ':' => Some(Tok::Colon),
            '?' => Some(Tok::Question),
            '=' => Some(Tok::Equals),
            _ => None,
        };
        if let Some(tok) = simple {
            tokens.push(Token { tok, line });
            i += 1;
            continue;
        }

        match c {
            '\n' => {
                tokens.push(Token {
                    tok: Tok::Newline,
                    line,
                });
                line += 1;
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '@' => {
                if chars.get(i + 1) == Some(&'@') {
                    tokens.push(Token {
                        tok: Tok::AtAt,
                        line,
                    });
                    i += 2;
                } else {
                    tokens.push(Token { tok: Tok::At, line });
                    i += 1;
                }
            }
            '"' => {
                let start_line = line;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None | Some('\n') => {
                            return Err(CoreError::schema(start_line, "unterminated string"));
                        }
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            if let Some(&escaped) = chars.get(i + 1) {
                                value.push(match escaped {
                                    'n' => '\n',
                                    't' => '\t',
                                    other => other,
                                });
                            }
                            i += 2;
                        }
                        Some(&other) => {
                            value.push(other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token {
                    tok: Tok::Str(value),
                    line: start_line,
                });
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token {
                    tok: Tok::Number(chars[start..i].iter().collect()),
                    line,
                });
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token {
                    tok: Tok::Ident(chars[start..i].iter().collect()),
                    line,
                });
            }
            other => {
                return Err(CoreError::schema(
                    line,
                    format!("unexpected character '{other}'"),
                ));
            }
        }
    }
    Ok(tokens)
}

/// Attribute argument value.
#[derive(Debug, Clone, PartialEq)]
enum ArgValue {
    Str(String),
    Number(String),
    Ident(String),
    Call(String, Vec<Arg>),
    List(Vec<ArgValue>),
}

#[derive(Debug, Clone, PartialEq)]
struct Arg {
    name: Option<String>,
    value: ArgValue,
}

#[derive(Debug, Clone)]
struct Attribute {
    name: String,
    args: Vec<Arg>,
    line: usize,
}

impl Attribute {
    fn arg(&self, name: &str) -> Option<&ArgValue> {
        self.args
            .iter()
            .find(|a| a.name.as_deref() == Some(name))
            .map(|a| &a.value)
    }

    fn positional(&self, index: usize) -> Option<&ArgValue> {
        self.args
            .iter()
            .filter(|a| a.name.is_none())
            .nth(index)
            .map(|a| &a.value)
    }

    fn name_list(&self, key: &str) -> CoreResult<Vec<String>> {
        let value = match self.arg(key) {
            Some(v) => v,
            None if key == "fields" => match self.positional(0) {
                Some(v @ ArgValue::List(_)) => v,
                _ => return Ok(Vec::new()),
            },
            None => return Ok(Vec::new()),
        };
        match value {
            ArgValue::List(items) => items
                .iter()
                .map(|item| match item {
                    ArgValue::Ident(name) => Ok(name.clone()),
                    ArgValue::Call(name, _) => Ok(name.clone()),
                    _ => Err(CoreError::schema(
                        self.line,
                        format!("@{} expects a list of field names", self.name),
                    )),
                })
                .collect(),
            _ => Err(CoreError::schema(
                self.line,
                format!("@{} expects a list for '{key}'", self.name),
            )),
        }
    }

    fn string_arg(&self) -> Option<String> {
        match self.arg("name").or_else(|| self.positional(0)) {
            Some(ArgValue::Str(s)) => Some(s.clone()),
            _ => None,
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

pub(super) fn parse(source: &str) -> CoreResult<Schema> {
    let mut parser = Parser {
        tokens: tokenize(source)?,
        pos: 0,
    };
    parser.schema()
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|t| &t.tok)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|t| t.tok.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn skip_newlines(&mut self) {
        while self.peek() == Some(&Tok::Newline) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: Tok, what: &str) -> CoreResult<()> {
        let line = self.line();
        match self.next() {
            Some(tok) if tok == expected => Ok(()),
            Some(tok) => Err(CoreError::schema(
                line,
                format!("expected {what}, found {}", describe(&tok)),
            )),
            None => Err(CoreError::schema(line, format!("expected {what}, found end of input"))),
        }
    }

    fn ident(&mut self, what: &str) -> CoreResult<String> {
        let line = self.line();
        match self.next() {
            Some(Tok::Ident(name)) => Ok(name),
            Some(tok) => Err(CoreError::schema(
                line,
                format!("expected {what}, found {}", describe(&tok)),
            )),
            None => Err(CoreError::schema(line, format!("expected {what}, found end of input"))),
        }
    }

    fn schema(&mut self) -> CoreResult<Schema> {
        let mut schema = Schema::default();
        loop {
            self.skip_newlines();
            if self.peek().is_none() {
                return Ok(schema);
            }
            let line = self.line();
            let keyword = self.ident("a block keyword")?;
            match keyword.as_str() {
                "model" => schema.models.push(self.model(line)?),
                "enum" => schema.enums.push(self.enum_def(line)?),
                "datasource" | "generator" => {
                    self.ident("a block name")?;
                    self.skip_block()?;
                }
                other => {
                    return Err(CoreError::schema(
                        line,
                        format!("unknown block '{other}' (expected model, enum, datasource or generator)"),
                    ));
                }
            }
        }
    }

    fn skip_block(&mut self) -> CoreResult<()> {
        self.expect(Tok::LBrace, "'{'")?;
        let start = self.line();
        let mut depth = 1usize;
        while depth > 0 {
            match self.next() {
                Some(Tok::LBrace) => depth += 1,
                Some(Tok::RBrace) => depth -= 1,
                Some(_) => {}
                None => return Err(CoreError::schema(start, "unterminated block")),
            }
        }
        Ok(())
    }

    fn enum_def(&mut self, line: usize) -> CoreResult<EnumDef> {
        let name = self.ident("an enum name")?;
        self.expect(Tok::LBrace, "'{'")?;
        let mut values = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                Some(Tok::RBrace) => {
                    self.pos += 1;
                    break;
                }
                Some(Tok::AtAt) | Some(Tok::At) => self.skip_line(),
                Some(Tok::Ident(_)) => {
                    values.push(self.ident("an enum value")?);
                    self.skip_line();
                }
                _ => {
                    return Err(CoreError::schema(
                        self.line(),
                        format!("unexpected token in enum '{name}'"),
                    ));
                }
            }
        }
        Ok(EnumDef { name, values, line })
    }

    fn skip_line(&mut self) {
        while !matches!(self.peek(), None | Some(Tok::Newline) | Some(Tok::RBrace)) {
            self.pos += 1;
        }
    }

    fn model(&mut self, line: usize) -> CoreResult<Model> {
        let name = self.ident("a model name")?;
        self.expect(Tok::LBrace, "'{'")?;
        let mut model = Model {
            name,
            db_name: None,
            fields: Vec::new(),
            compound_id: Vec::new(),
            unique_sets: Vec::new(),
            line,
        };

        loop {
            self.skip_newlines();
            match self.peek() {
                Some(Tok::RBrace) => {
                    self.pos += 1;
                    return Ok(model);
                }
                Some(Tok::AtAt) => {
                    self.pos += 1;
                    let attr = self.attribute()?;
                    match attr.name.as_str() {
                        "id" => model.compound_id = attr.name_list("fields")?,
                        "unique" => model.unique_sets.push(attr.name_list("fields")?),
                        "map" => model.db_name = attr.string_arg(),
                        // @@index, @@schema and friends have no effect here.
                        _ => {}
                    }
                }
                Some(Tok::Ident(_)) => {
                    let field = self.field()?;
                    model.fields.push(field);
                }
                None => {
                    return Err(CoreError::schema(
                        line,
                        format!("model '{}' is missing a closing '}}'", model.name),
                    ));
                }
                Some(tok) => {
                    return Err(CoreError::schema(
                        self.line(),
                        format!("unexpected {} in model '{}'", describe(tok), model.name),
                    ));
                }
            }
        }
    }

    fn field(&mut self) -> CoreResult<Field> {
        let line = self.line();
        let name = self.ident("a field name")?;
        let type_name = self.ident(&format!("a type for field '{name}'"))?;

        let arity = match self.peek() {
            Some(Tok::Question) => {
                self.pos += 1;
                Arity::Optional
            }
            Some(Tok::LBracket) => {
                self.pos += 1;
                self.expect(Tok::RBracket, "']'")?;
                Arity::List
            }
            _ => Arity::Required,
        };

        let mut field = Field {
            name,
            db_name: None,
            ty: resolve_type(&type_name),
            arity,
            is_id: false,
            is_unique: false,
            default: None,
            relation: None,
            line,
        };

        while self.peek() == Some(&Tok::At) {
            self.pos += 1;
            let attr = self.attribute()?;
            match attr.name.as_str() {
                "id" => field.is_id = true,
                "unique" => field.is_unique = true,
                "map" => field.db_name = attr.string_arg(),
                "default" => field.default = Some(default_value(&attr)?),
                "relation" => {
                    field.relation = Some(Relation {
                        name: attr.string_arg(),
                        fields: attr.name_list("fields")?,
                        references: attr.name_list("references")?,
                    });
                }
                // Native type hints (@db.VarChar(..)) and @updatedAt are
                // accepted and ignored.
                _ => {}
            }
        }

        match self.peek() {
            None | Some(Tok::Newline) | Some(Tok::RBrace) => Ok(field),
            Some(tok) => Err(CoreError::schema(
                self.line(),
                format!("unexpected {} after field '{}'", describe(tok), field.name),
            )),
        }
    }

    fn attribute(&mut self) -> CoreResult<Attribute> {
        let line = self.line();
        let name = self.ident("an attribute name")?;
        let args = if self.peek() == Some(&Tok::LParen) {
            self.pos += 1;
            self.args()?
        } else {
            Vec::new()
        };
        Ok(Attribute { name, args, line })
    }

    /// Parse arguments up to and including the closing `)`.
    fn args(&mut self) -> CoreResult<Vec<Arg>> {
        let mut args = Vec::new();
        loop {
            match self.peek() {
                Some(Tok::RParen) => {
                    self.pos += 1;
                    return Ok(args);
                }
                Some(Tok::Comma) | Some(Tok::Newline) => self.pos += 1,
                _ => {
                    let named = matches!(
                        (self.peek(), self.tokens.get(self.pos + 1).map(|t| &t.tok)),
                        (Some(Tok::Ident(_)), Some(Tok::Colon))
                    );
                    let name = if named {
                        let n = self.ident("an argument name")?;
                        self.pos += 1;
                        Some(n)
                    } else {
                        None
                    };
                    let value = self.arg_value()?;
                    args.push(Arg { name, value });
                }
            }
        }
    }

    fn arg_value(&mut self) -> CoreResult<ArgValue> {
        let line = self.line();
        match self.next() {
            Some(Tok::Str(s)) => Ok(ArgValue::Str(s)),
            Some(Tok::Number(n)) => Ok(ArgValue::Number(n)),
            Some(Tok::Ident(name)) => {
                if self.peek() == Some(&Tok::LParen) {
                    self.pos += 1;
                    let args = self.args()?;
                    Ok(ArgValue::Call(name, args))
                } else {
                    Ok(ArgValue::Ident(name))
                }
            }
            Some(Tok::LBracket) => {
                let mut items = Vec::new();
                loop {
                    match self.peek() {
                        Some(Tok::RBracket) => {
                            self.pos += 1;
                            return Ok(ArgValue::List(items));
                        }
                        Some(Tok::Comma) | Some(Tok::Newline) => self.pos += 1,
                        _ => items.push(self.arg_value()?),
                    }
                }
            }
            Some(tok) => Err(CoreError::schema(
                line,
                format!("unexpected {} in attribute arguments", describe(&tok)),
            )),
            None => Err(CoreError::schema(line, "unterminated attribute arguments")),
        }
    }
}

fn resolve_type(name: &str) -> FieldType {
    match ScalarType::from_name(name) {
        Some(scalar) => FieldType::Scalar(scalar),
        // Enum vs. model is settled once every block has been read.
        None => FieldType::Model(name.to_string()),
    }
}

fn default_value(attr: &Attribute) -> CoreResult<DefaultValue> {
    let Some(value) = attr.positional(0).or_else(|| attr.arg("value")) else {
        return Err(CoreError::schema(attr.line, "@default needs a value"));
    };
    Ok(match value {
        ArgValue::Call(func, _) => match func.as_str() {
            "autoincrement" => DefaultValue::AutoIncrement,
            "now" => DefaultValue::Now,
            other => DefaultValue::Generated(other.to_string()),
        },
        ArgValue::Str(s) => DefaultValue::Literal(quote_literal(s)),
        ArgValue::Number(n) => DefaultValue::Literal(n.clone()),
        ArgValue::Ident(word) if word == "true" || word == "false" => {
            DefaultValue::Literal(word.to_uppercase())
        }
        ArgValue::Ident(word) => DefaultValue::Literal(quote_literal(word)),
        ArgValue::List(_) => DefaultValue::Literal("'[]'".to_string()),
    })
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Ident(s) => format!("'{s}'"),
        Tok::Str(s) => format!("string \"{s}\""),
        Tok::Number(n) => format!("number {n}"),
        Tok::LBrace => "'{'".into(),
        Tok::RBrace => "'}'".into(),
        Tok::LParen => "'('".into(),
        Tok::RParen => "')'".into(),
        Tok::LBracket => "'['".into(),
        Tok::RBracket => "']'".into(),
        Tok::Comma => "','".into(),
        Tok::Colon => "':'".into(),
        Tok::Question => "'?'".into(),
        Tok::Equals => "'='".into(),
        Tok::At => "'@'".into(),
        Tok::AtAt => "'@@'".into(),
        Tok::Newline => "end of line".into(),
    }
}

/// Turn provisional model references that name an enum into enum types.
pub(super) fn resolve_enums(schema: &mut Schema) {
    let enum_names: Vec<String> = schema.enums.iter().map(|e| e.name.clone()).collect();
    for model in &mut schema.models {
        for field in &mut model.fields {
            if let FieldType::Model(name) = &field.ty {
                if enum_names.contains(name) {
                    field.ty = FieldType::Enum(name.clone());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
