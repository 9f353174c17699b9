//! LDAP 风格的服务选择表达式。
//!
//! # 模块定位（Why）
//! - 能力引用通过过滤表达式描述“哪些已发布实例可以满足我”，注册表的查询与订阅均以此为谓词；
//! - 表达式语法沿用 RFC 1960 的前缀形式，便于与既有配置文件互通。
//!
//! # 语法概览（What）
//! - 组合：`(&F...)`、`(|F...)`、`(!F)`；
//! - 原子：`(k=v)`、`(k=*)`（存在性）、`(k=a*b*c)`（子串）、`(k>=v)`、`(k<=v)`、`(k~=v)`（近似）；
//! - 值中的 `(`、`)`、`*`、`\` 需以 `\` 转义；键名两侧空白会被忽略。
//!
//! # 求值规则（How）
//! - 属性为整数/浮点时将字面量解析为数值再比较，解析失败视为不匹配；
//! - 属性为列表时，任一元素匹配即视为匹配；
//! - 近似匹配忽略大小写与空白。

use std::fmt;

use thiserror::Error;

use crate::properties::{OBJECT_CLASS, Properties, PropertyValue};

/// 解析过滤表达式时的错误，`offset` 为输入中的字节位置。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum FilterError {
    #[error("filter expression is empty")]
    Empty,
    #[error("expected `{expected}` at offset {offset}")]
    Expected { expected: char, offset: usize },
    #[error("missing attribute name at offset {offset}")]
    MissingKey { offset: usize },
    #[error("invalid comparison operator at offset {offset}")]
    InvalidOperator { offset: usize },
    #[error("composite filter at offset {offset} has no operands")]
    EmptyComposite { offset: usize },
    #[error("unescaped `(` inside value at offset {offset}")]
    InvalidValue { offset: usize },
    #[error("unexpected end of filter expression")]
    UnexpectedEnd,
    #[error("unexpected trailing input at offset {offset}")]
    TrailingInput { offset: usize },
}

/// 已解析的过滤表达式树。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Present {
        key: String,
    },
    Equal {
        key: String,
        value: String,
    },
    Substring {
        key: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
    GreaterEq {
        key: String,
        value: String,
    },
    LessEq {
        key: String,
        value: String,
    },
    Approx {
        key: String,
        value: String,
    },
}

#[derive(Clone, Copy)]
enum Comparison {
    Equal,
    GreaterEq,
    LessEq,
    Approx,
}

impl Filter {
    /// 解析文本形式的过滤表达式。
    ///
    /// # 契约说明（What）
    /// - 输入首尾允许空白；空串返回 [`FilterError::Empty`]；
    /// - 解析成功后的表达式满足 `Filter::parse(&f.to_string()) == Ok(f)`。
    pub fn parse(input: &str) -> Result<Filter, FilterError> {
        let mut parser = Parser::new(input);
        parser.skip_whitespace();
        if parser.at_end() {
            return Err(FilterError::Empty);
        }
        let filter = parser.parse_filter()?;
        parser.skip_whitespace();
        if !parser.at_end() {
            return Err(FilterError::TrailingInput { offset: parser.pos });
        }
        Ok(filter)
    }

    /// 构造 `(key=value)`。
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Filter {
        Filter::Equal {
            key: key.into(),
            value: value.into(),
        }
    }

    /// 构造匹配全部接口名的表达式：单接口为 `(objectClass=I)`，多接口为合取。
    pub fn for_interfaces<S: AsRef<str>>(interfaces: &[S]) -> Filter {
        let mut clauses: Vec<Filter> = interfaces
            .iter()
            .map(|interface| Filter::equals(OBJECT_CLASS, interface.as_ref()))
            .collect();
        match clauses.len() {
            0 => Filter::Present {
                key: OBJECT_CLASS.to_owned(),
            },
            1 => clauses.remove(0),
            _ => Filter::And(clauses),
        }
    }

    /// 合取两个表达式，已有的 `And` 会被展平。
    #[must_use]
    pub fn and(self, other: Filter) -> Filter {
        let mut clauses = match self {
            Filter::And(clauses) => clauses,
            single => vec![single],
        };
        match other {
            Filter::And(more) => clauses.extend(more),
            single => clauses.push(single),
        }
        Filter::And(clauses)
    }

    /// 对属性表求值。
    pub fn matches(&self, properties: &Properties) -> bool {
        match self {
            Filter::And(clauses) => clauses.iter().all(|clause| clause.matches(properties)),
            Filter::Or(clauses) => clauses.iter().any(|clause| clause.matches(properties)),
            Filter::Not(inner) => !inner.matches(properties),
            Filter::Present { key } => properties.contains_key(key),
            Filter::Equal { key, value } => {
                compare_property(properties.get(key), value, Comparison::Equal)
            }
            Filter::GreaterEq { key, value } => {
                compare_property(properties.get(key), value, Comparison::GreaterEq)
            }
            Filter::LessEq { key, value } => {
                compare_property(properties.get(key), value, Comparison::LessEq)
            }
            Filter::Approx { key, value } => {
                compare_property(properties.get(key), value, Comparison::Approx)
            }
            Filter::Substring {
                key,
                initial,
                any,
                last,
            } => properties
                .get(key)
                .is_some_and(|property| substring_matches(property, initial, any, last)),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(clauses) => write_composite(f, '&', clauses),
            Filter::Or(clauses) => write_composite(f, '|', clauses),
            Filter::Not(inner) => write!(f, "(!{inner})"),
            Filter::Present { key } => write!(f, "({key}=*)"),
            Filter::Equal { key, value } => write!(f, "({key}={})", Escaped(value)),
            Filter::GreaterEq { key, value } => write!(f, "({key}>={})", Escaped(value)),
            Filter::LessEq { key, value } => write!(f, "({key}<={})", Escaped(value)),
            Filter::Approx { key, value } => write!(f, "({key}~={})", Escaped(value)),
            Filter::Substring {
                key,
                initial,
                any,
                last,
            } => {
                write!(f, "({key}=")?;
                if let Some(initial) = initial {
                    write!(f, "{}", Escaped(initial))?;
                }
                f.write_str("*")?;
                for piece in any {
                    write!(f, "{}*", Escaped(piece))?;
                }
                if let Some(last) = last {
                    write!(f, "{}", Escaped(last))?;
                }
                f.write_str(")")
            }
        }
    }
}

impl std::str::FromStr for Filter {
    type Err = FilterError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Filter::parse(input)
    }
}

fn write_composite(f: &mut fmt::Formatter<'_>, op: char, clauses: &[Filter]) -> fmt::Result {
    write!(f, "({op}")?;
    for clause in clauses {
        write!(f, "{clause}")?;
    }
    f.write_str(")")
}

struct Escaped<'a>(&'a str);

impl fmt::Display for Escaped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for ch in self.0.chars() {
            if matches!(ch, '(' | ')' | '*' | '\\') {
                f.write_str("\\")?;
            }
            write!(f, "{ch}")?;
        }
        Ok(())
    }
}

fn compare_property(property: Option<&PropertyValue>, literal: &str, op: Comparison) -> bool {
    property.is_some_and(|property| compare_value(property, literal, op))
}

fn compare_value(property: &PropertyValue, literal: &str, op: Comparison) -> bool {
    match property {
        PropertyValue::List(values) => values.iter().any(|value| compare_value(value, literal, op)),
        PropertyValue::Str(value) => match op {
            Comparison::Equal => value == literal,
            Comparison::GreaterEq => value.as_str() >= literal,
            Comparison::LessEq => value.as_str() <= literal,
            Comparison::Approx => normalize(value) == normalize(literal),
        },
        PropertyValue::Int(value) => match literal.trim().parse::<i64>() {
            Ok(literal) => match op {
                Comparison::Equal | Comparison::Approx => *value == literal,
                Comparison::GreaterEq => *value >= literal,
                Comparison::LessEq => *value <= literal,
            },
            Err(_) => false,
        },
        PropertyValue::Float(value) => match literal.trim().parse::<f64>() {
            Ok(literal) => match op {
                Comparison::Equal | Comparison::Approx => *value == literal,
                Comparison::GreaterEq => *value >= literal,
                Comparison::LessEq => *value <= literal,
            },
            Err(_) => false,
        },
        PropertyValue::Bool(value) => match op {
            Comparison::Equal | Comparison::Approx => {
                let literal = literal.trim();
                (*value && literal.eq_ignore_ascii_case("true"))
                    || (!*value && literal.eq_ignore_ascii_case("false"))
            }
            Comparison::GreaterEq | Comparison::LessEq => false,
        },
    }
}

fn normalize(value: &str) -> String {
    value
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn substring_matches(
    property: &PropertyValue,
    initial: &Option<String>,
    any: &[String],
    last: &Option<String>,
) -> bool {
    match property {
        PropertyValue::List(values) => values
            .iter()
            .any(|value| substring_matches(value, initial, any, last)),
        PropertyValue::Str(value) => {
            let mut rest = value.as_str();
            if let Some(initial) = initial {
                match rest.strip_prefix(initial.as_str()) {
                    Some(tail) => rest = tail,
                    None => return false,
                }
            }
            for piece in any {
                match rest.find(piece.as_str()) {
                    Some(index) => rest = &rest[index + piece.len()..],
                    None => return false,
                }
            }
            match last {
                Some(last) => rest.ends_with(last.as_str()),
                None => true,
            }
        }
        _ => false,
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            bytes: input.as_bytes(),
            input,
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|byte| byte.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: u8) -> Result<(), FilterError> {
        match self.peek() {
            Some(byte) if byte == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(_) => Err(FilterError::Expected {
                expected: char::from(expected),
                offset: self.pos,
            }),
            None => Err(FilterError::UnexpectedEnd),
        }
    }

    fn parse_filter(&mut self) -> Result<Filter, FilterError> {
        self.skip_whitespace();
        self.expect(b'(')?;
        self.skip_whitespace();
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.parse_list()?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.parse_list()?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(_) => self.parse_item()?,
            None => return Err(FilterError::UnexpectedEnd),
        };
        self.skip_whitespace();
        self.expect(b')')?;
        Ok(filter)
    }

    fn parse_list(&mut self) -> Result<Vec<Filter>, FilterError> {
        let start = self.pos;
        let mut clauses = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek() == Some(b'(') {
                clauses.push(self.parse_filter()?);
            } else {
                break;
            }
        }
        if clauses.is_empty() {
            return Err(FilterError::EmptyComposite { offset: start });
        }
        Ok(clauses)
    }

    fn parse_item(&mut self) -> Result<Filter, FilterError> {
        let key_start = self.pos;
        while let Some(byte) = self.peek() {
            if matches!(byte, b'=' | b'<' | b'>' | b'~' | b'(' | b')') {
                break;
            }
            self.pos += 1;
        }
        let key = self.input[key_start..self.pos].trim();
        if key.is_empty() {
            return Err(FilterError::MissingKey { offset: key_start });
        }
        let key = key.to_owned();

        let op_offset = self.pos;
        let op = match self.peek() {
            Some(b'=') => {
                self.pos += 1;
                Comparison::Equal
            }
            Some(b'>') | Some(b'<') | Some(b'~') => {
                let first = self.bytes[self.pos];
                self.pos += 1;
                if self.peek() != Some(b'=') {
                    return Err(FilterError::InvalidOperator { offset: op_offset });
                }
                self.pos += 1;
                match first {
                    b'>' => Comparison::GreaterEq,
                    b'<' => Comparison::LessEq,
                    _ => Comparison::Approx,
                }
            }
            Some(_) => return Err(FilterError::InvalidOperator { offset: op_offset }),
            None => return Err(FilterError::UnexpectedEnd),
        };

        let segments = self.parse_value()?;
        let filter = match op {
            Comparison::Equal if segments.len() == 1 => Filter::Equal {
                key,
                value: segments.into_iter().next().unwrap_or_default(),
            },
            Comparison::Equal if segments.iter().all(String::is_empty) => {
                Filter::Present { key }
            }
            Comparison::Equal => {
                let mut segments = segments;
                let last = segments.pop().filter(|piece| !piece.is_empty());
                let mut pieces = segments.into_iter();
                let initial = pieces.next().filter(|piece| !piece.is_empty());
                let any = pieces.filter(|piece| !piece.is_empty()).collect();
                Filter::Substring {
                    key,
                    initial,
                    any,
                    last,
                }
            }
            // 比较类运算符不支持通配，星号按字面量处理。
            Comparison::GreaterEq => Filter::GreaterEq {
                key,
                value: segments.join("*"),
            },
            Comparison::LessEq => Filter::LessEq {
                key,
                value: segments.join("*"),
            },
            Comparison::Approx => Filter::Approx {
                key,
                value: segments.join("*"),
            },
        };
        Ok(filter)
    }

    /// 读取取值直到未转义的 `)`，按未转义的 `*` 切分为片段。
    fn parse_value(&mut self) -> Result<Vec<String>, FilterError> {
        let mut segments = vec![String::new()];
        let mut chars = self.input[self.pos..].char_indices();
        loop {
            let Some((offset, ch)) = chars.next() else {
                self.pos = self.bytes.len();
                return Err(FilterError::UnexpectedEnd);
            };
            match ch {
                ')' => {
                    self.pos += offset;
                    return Ok(segments);
                }
                '(' => {
                    return Err(FilterError::InvalidValue {
                        offset: self.pos + offset,
                    });
                }
                '*' => segments.push(String::new()),
                '\\' => match chars.next() {
                    Some((_, escaped)) => push_char(&mut segments, escaped),
                    None => {
                        self.pos = self.bytes.len();
                        return Err(FilterError::UnexpectedEnd);
                    }
                },
                other => push_char(&mut segments, other),
            }
        }
    }
}

fn push_char(segments: &mut [String], ch: char) {
    if let Some(segment) = segments.last_mut() {
        segment.push(ch);
    }
}
