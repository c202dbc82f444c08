//! Search filter parsing and matching for the mock directory
//!
//! String form only (`(&(objectClass=person)(|(cn=a*)(!(sn=b))))`).
//! Comparison is case-insensitive; ordering comparisons are numeric when
//! both sides are integers.

use dirproto::SearchEntry;
use std::cmp::Ordering;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality(String, String),
    Present(String),
    Substring {
        attribute: String,
        initial: Option<String>,
        any: Vec<String>,
        last: Option<String>,
    },
    GreaterOrEqual(String, String),
    LessOrEqual(String, String),
    Approx(String, String),
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<(), String> {
        match self.peek() {
            Some(b) if b == byte => {
                self.pos += 1;
                Ok(())
            }
            Some(b) => Err(format!(
                "expected '{}' at offset {}, found '{}'",
                byte as char, self.pos, b as char
            )),
            None => Err(format!("expected '{}' at end of filter", byte as char)),
        }
    }

    fn parse_filter(&mut self) -> Result<Filter, String> {
        self.expect(b'(')?;
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
            _ => self.parse_item()?,
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn parse_list(&mut self) -> Result<Vec<Filter>, String> {
        let mut filters = Vec::new();
        while self.peek() == Some(b'(') {
            filters.push(self.parse_filter()?);
        }
        Ok(filters)
    }

    fn parse_item(&mut self) -> Result<Filter, String> {
        let start = self.pos;
        while !matches!(self.peek(), Some(b')') | None) {
            self.pos += 1;
        }
        let item = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| "filter is not UTF-8".to_string())?;

        let eq = item
            .find('=')
            .ok_or_else(|| format!("no operator in '{}'", item))?;
        let (attribute, operator) = match item[..eq].chars().last() {
            Some('~') => (&item[..eq - 1], "~="),
            Some('>') => (&item[..eq - 1], ">="),
            Some('<') => (&item[..eq - 1], "<="),
            _ => (&item[..eq], "="),
        };
        let attribute = attribute.trim().to_string();
        if attribute.is_empty() {
            return Err(format!("missing attribute in '{}'", item));
        }
        let raw = &item[eq + 1..];

        Ok(match operator {
            "~=" => Filter::Approx(attribute, unescape(raw)?),
            ">=" => Filter::GreaterOrEqual(attribute, unescape(raw)?),
            "<=" => Filter::LessOrEqual(attribute, unescape(raw)?),
            _ if raw == "*" => Filter::Present(attribute),
            _ if raw.contains('*') => {
                let pieces: Vec<&str> = raw.split('*').collect();
                let initial = pieces.first().filter(|p| !p.is_empty());
                let last = pieces.last().filter(|p| !p.is_empty());
                let any = pieces[1..pieces.len() - 1]
                    .iter()
                    .filter(|p| !p.is_empty())
                    .map(|p| unescape(p))
                    .collect::<Result<Vec<_>, _>>()?;
                Filter::Substring {
                    attribute,
                    initial: initial.map(|p| unescape(p)).transpose()?,
                    any,
                    last: last.map(|p| unescape(p)).transpose()?,
                }
            }
            _ => Filter::Equality(attribute, unescape(raw)?),
        })
    }
}

/// Resolve `\xx` hex escapes
fn unescape(raw: &str) -> Result<String, String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hex = raw
                .get(i + 1..i + 3)
                .ok_or_else(|| format!("truncated escape in '{}'", raw))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| format!("invalid escape '\\{}' in '{}'", hex, raw))?;
            out.push(byte);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

impl FromStr for Filter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        let s = s.trim();
        let wrapped;
        let text = if s.starts_with('(') {
            s
        } else {
            wrapped = format!("({})", s);
            &wrapped
        };
        let mut parser = Parser {
            input: text.as_bytes(),
            pos: 0,
        };
        let filter = parser.parse_filter()?;
        if parser.pos != text.len() {
            return Err(format!("trailing characters after filter at offset {}", parser.pos));
        }
        Ok(filter)
    }
}

fn values<'e>(entry: &'e SearchEntry, attribute: &str) -> impl Iterator<Item = String> + 'e {
    let attribute = attribute.to_string();
    entry
        .attributes
        .iter()
        .filter(move |(name, _)| name.eq_ignore_ascii_case(&attribute))
        .flat_map(|(_, values)| values.iter())
        .map(|value| String::from_utf8_lossy(value).to_lowercase())
}

fn compare(value: &str, assertion: &str) -> Ordering {
    match (value.trim().parse::<i64>(), assertion.trim().parse::<i64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => value.cmp(assertion),
    }
}

fn substring_matches(value: &str, initial: Option<&str>, any: &[String], last: Option<&str>) -> bool {
    let mut rest = value;
    if let Some(initial) = initial {
        match rest.strip_prefix(initial) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for piece in any {
        match rest.find(piece.as_str()) {
            Some(at) => rest = &rest[at + piece.len()..],
            None => return false,
        }
    }
    match last {
        Some(last) => rest.ends_with(last),
        None => true,
    }
}

impl Filter {
    pub fn matches(&self, entry: &SearchEntry) -> bool {
        match self {
            Filter::And(filters) => filters.iter().all(|f| f.matches(entry)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(entry)),
            Filter::Not(filter) => !filter.matches(entry),
            Filter::Present(attribute) => values(entry, attribute).next().is_some(),
            Filter::Equality(attribute, assertion) => {
                let assertion = assertion.to_lowercase();
                values(entry, attribute).any(|v| v == assertion)
            }
            Filter::Approx(attribute, assertion) => {
                let squash = |s: &str| s.split_whitespace().collect::<String>().to_lowercase();
                let assertion = squash(assertion);
                values(entry, attribute).any(|v| squash(&v) == assertion)
            }
            Filter::GreaterOrEqual(attribute, assertion) => {
                let assertion = assertion.to_lowercase();
                values(entry, attribute).any(|v| compare(&v, &assertion) != Ordering::Less)
            }
            Filter::LessOrEqual(attribute, assertion) => {
                let assertion = assertion.to_lowercase();
                values(entry, attribute).any(|v| compare(&v, &assertion) != Ordering::Greater)
            }
            Filter::Substring {
                attribute,
                initial,
                any,
                last,
            } => {
                let initial = initial.as_ref().map(|s| s.to_lowercase());
                let any: Vec<String> = any.iter().map(|s| s.to_lowercase()).collect();
                let last = last.as_ref().map(|s| s.to_lowercase());
                values(entry, attribute)
                    .any(|v| substring_matches(&v, initial.as_deref(), &any, last.as_deref()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use dirproto::Attributes;

    fn person() -> SearchEntry {
        let mut attributes = Attributes::new();
        attributes.insert("objectClass".into(), vec![Bytes::from("person"), Bytes::from("top")]);
        attributes.insert("cn".into(), vec![Bytes::from("John Smith")]);
        attributes.insert("uidNumber".into(), vec![Bytes::from("1000")]);
        attributes.insert("description".into(), vec![Bytes::from("a (b) c")]);
        SearchEntry::new("cn=John Smith,ou=people,dc=example,dc=com", attributes)
    }

    fn matches(filter: &str) -> bool {
        filter.parse::<Filter>().unwrap().matches(&person())
    }

    #[test]
    fn test_simple_items() {
        assert!(matches("(objectClass=*)"));
        assert!(matches("(OBJECTCLASS=Person)"));
        assert!(!matches("(sn=*)"));
        assert!(matches("cn=john smith"));
        assert!(matches("(cn~=johnsmith)"));
    }

    #[test]
    fn test_substrings() {
        assert!(matches("(cn=John*)"));
        assert!(matches("(cn=*smith)"));
        assert!(matches("(cn=j*n*th)"));
        assert!(!matches("(cn=*smith*john)"));
    }

    #[test]
    fn test_ordering_is_numeric_for_integers() {
        assert!(matches("(uidNumber>=999)"));
        assert!(matches("(uidNumber<=1000)"));
        assert!(!matches("(uidNumber>=10000)"));
    }

    #[test]
    fn test_boolean_combinations() {
        assert!(matches("(&(objectClass=person)(|(cn=nobody)(cn=john*)))"));
        assert!(matches("(!(cn=nobody))"));
        assert!(!matches("(&(objectClass=person)(!(cn=john*)))"));
        assert!(matches("(&)"));
        assert!(!matches("(|)"));
    }

    #[test]
    fn test_escapes() {
        assert!(matches("(description=a \\28b\\29 c)"));
        assert!("(cn=\\2)".parse::<Filter>().is_err());
    }

    #[test]
    fn test_malformed_filters() {
        assert!("(cn=a".parse::<Filter>().is_err());
        assert!("(cn)".parse::<Filter>().is_err());
        assert!("(cn=a))".parse::<Filter>().is_err());
        assert!("(=a)".parse::<Filter>().is_err());
    }
}
