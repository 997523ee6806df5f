//! Template parsing.
//!
//! # Syntax
//!
//! - `{{ path }}`: dotted lookup, e.g. `{{ base_artifact.id }}`
//! - `{{ path | default('text') }}`: fallback for missing or null values
//! - `{{ path | join(',') }}`: join a list
//! - `{{ path | quote }}`: a single-quoted shell word
//! - `{% if path %}..{% else %}..{% endif %}`, `{% if not path %}`
//!
//! Everything outside tags is literal text. There is no escaping: a template
//! cannot produce a literal `{{` or `{%`.

use std::iter::Peekable;
use std::str::Chars;

use super::RenderError;

/// A parsed template fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
  Text(String),
  Expr(Expr),
  If {
    cond: Condition,
    then: Vec<Node>,
    otherwise: Vec<Node>,
  },
}

/// `path | filter(arg) | ...`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expr {
  pub path: String,
  pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
  Default(String),
  Join(String),
  Quote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
  pub path: String,
  pub negated: bool,
}

#[derive(Clone, Copy)]
enum TagKind {
  Expr,
  Block,
}

/// An open `if` block, or the top level.
struct Frame {
  cond: Option<Condition>,
  pos: usize,
  then: Vec<Node>,
  otherwise: Option<Vec<Node>>,
}

impl Frame {
  fn new(cond: Option<Condition>, pos: usize) -> Self {
    Self {
      cond,
      pos,
      then: Vec::new(),
      otherwise: None,
    }
  }

  fn current(&mut self) -> &mut Vec<Node> {
    match &mut self.otherwise {
      Some(otherwise) => otherwise,
      None => &mut self.then,
    }
  }
}

/// Parse a template string into nodes.
pub fn parse(input: &str) -> Result<Vec<Node>, RenderError> {
  let mut stack = vec![Frame::new(None, 0)];
  let mut rest = input;
  let mut offset = 0;

  while let Some((start, kind)) = next_tag(rest) {
    push_text(&mut stack, &rest[..start]);

    let close = match kind {
      TagKind::Expr => "}}",
      TagKind::Block => "%}",
    };
    let body_start = start + 2;
    let Some(len) = find_close(&rest[body_start..], close) else {
      return Err(RenderError::Unclosed(offset + start));
    };
    let body = rest[body_start..body_start + len].trim();
    let pos = offset + start;

    match kind {
      TagKind::Expr => {
        let expr = parse_expr(body)?;
        current(&mut stack).push(Node::Expr(expr));
      }
      TagKind::Block => block_tag(&mut stack, body, pos)?,
    }

    let consumed = body_start + len + close.len();
    offset += consumed;
    rest = &rest[consumed..];
  }
  push_text(&mut stack, rest);

  if stack.len() > 1 {
    let pos = stack.last().map(|f| f.pos).unwrap_or(0);
    return Err(RenderError::UnclosedBlock(pos));
  }
  Ok(stack.pop().map(|f| f.then).unwrap_or_default())
}

/// Position of `close` in `s`, ignoring occurrences inside quoted literals.
fn find_close(s: &str, close: &str) -> Option<usize> {
  let mut quote = None;
  for (i, c) in s.char_indices() {
    match quote {
      Some(q) if c == q => quote = None,
      Some(_) => {}
      None if c == '\'' || c == '"' => quote = Some(c),
      None if s[i..].starts_with(close) => return Some(i),
      None => {}
    }
  }
  None
}

fn next_tag(s: &str) -> Option<(usize, TagKind)> {
  let expr = s.find("{{").map(|i| (i, TagKind::Expr));
  let block = s.find("{%").map(|i| (i, TagKind::Block));
  match (expr, block) {
    (Some(e), Some(b)) => Some(if e.0 < b.0 { e } else { b }),
    (e, b) => e.or(b),
  }
}

fn current(stack: &mut [Frame]) -> &mut Vec<Node> {
  // The top-level frame is never popped.
  let last = stack.len() - 1;
  stack[last].current()
}

fn push_text(stack: &mut [Frame], text: &str) {
  if text.is_empty() {
    return;
  }
  let nodes = current(stack);
  match nodes.last_mut() {
    Some(Node::Text(prev)) => prev.push_str(text),
    _ => nodes.push(Node::Text(text.to_string())),
  }
}

fn block_tag(stack: &mut Vec<Frame>, body: &str, pos: usize) -> Result<(), RenderError> {
  let (keyword, arg) = match body.split_once(char::is_whitespace) {
    Some((keyword, arg)) => (keyword, arg.trim()),
    None => (body, ""),
  };

  match keyword {
    "if" => {
      let cond = parse_condition(arg)?;
      stack.push(Frame::new(Some(cond), pos));
    }
    "else" if arg.is_empty() => {
      let frame = stack.last_mut().filter(|f| f.cond.is_some() && f.otherwise.is_none());
      let Some(frame) = frame else {
        return Err(RenderError::UnexpectedTag("else".to_string(), pos));
      };
      frame.otherwise = Some(Vec::new());
    }
    "endif" if arg.is_empty() => {
      if stack.len() < 2 {
        return Err(RenderError::UnexpectedTag("endif".to_string(), pos));
      }
      let Some(Frame {
        cond: Some(cond),
        then,
        otherwise,
        ..
      }) = stack.pop()
      else {
        return Err(RenderError::UnexpectedTag("endif".to_string(), pos));
      };
      current(stack).push(Node::If {
        cond,
        then,
        otherwise: otherwise.unwrap_or_default(),
      });
    }
    _ => return Err(RenderError::UnexpectedTag(body.to_string(), pos)),
  }
  Ok(())
}

fn parse_condition(arg: &str) -> Result<Condition, RenderError> {
  let (negated, path) = match arg.strip_prefix("not") {
    Some(rest) if rest.starts_with(char::is_whitespace) => (true, rest.trim()),
    _ => (false, arg),
  };
  check_path(path)?;
  Ok(Condition {
    path: path.to_string(),
    negated,
  })
}

fn check_path(path: &str) -> Result<(), RenderError> {
  let valid = !path.is_empty()
    && path
      .split('.')
      .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
  if valid {
    Ok(())
  } else {
    Err(RenderError::Syntax(format!("invalid variable '{path}'")))
  }
}

struct Cursor<'a> {
  chars: Peekable<Chars<'a>>,
  source: &'a str,
}

impl<'a> Cursor<'a> {
  fn new(source: &'a str) -> Self {
    Self {
      chars: source.chars().peekable(),
      source,
    }
  }

  fn skip_ws(&mut self) {
    while self.chars.next_if(|c| c.is_whitespace()).is_some() {}
  }

  fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
    let mut out = String::new();
    while let Some(c) = self.chars.next_if(|c| pred(*c)) {
      out.push(c);
    }
    out
  }

  fn expect(&mut self, want: char) -> Result<(), RenderError> {
    match self.chars.next() {
      Some(c) if c == want => Ok(()),
      Some(c) => Err(self.error(format!("expected '{want}', found '{c}'"))),
      None => Err(self.error(format!("expected '{want}'"))),
    }
  }

  fn string_literal(&mut self) -> Result<String, RenderError> {
    let quote = match self.chars.next() {
      Some(q @ ('\'' | '"')) => q,
      _ => return Err(self.error("expected a quoted string".to_string())),
    };
    let value = self.take_while(|c| c != quote);
    self.expect(quote)?;
    Ok(value)
  }

  fn error(&self, message: String) -> RenderError {
    RenderError::Syntax(format!("{message} in '{}'", self.source))
  }
}

fn parse_expr(body: &str) -> Result<Expr, RenderError> {
  let mut cursor = Cursor::new(body);
  let path = cursor.take_while(|c| !c.is_whitespace() && c != '|');
  check_path(&path)?;

  let mut filters = Vec::new();
  loop {
    cursor.skip_ws();
    if cursor.chars.peek().is_none() {
      break;
    }
    cursor.expect('|')?;
    cursor.skip_ws();
    let name = cursor.take_while(|c| c.is_ascii_alphanumeric() || c == '_');
    cursor.skip_ws();
    let arg = if cursor.chars.next_if_eq(&'(').is_some() {
      cursor.skip_ws();
      let arg = cursor.string_literal()?;
      cursor.skip_ws();
      cursor.expect(')')?;
      Some(arg)
    } else {
      None
    };

    filters.push(match (name.as_str(), arg) {
      ("default", Some(arg)) => Filter::Default(arg),
      ("join", Some(arg)) => Filter::Join(arg),
      ("quote", None) => Filter::Quote,
      ("default" | "join", None) => return Err(cursor.error(format!("filter '{name}' needs an argument"))),
      ("quote", Some(_)) => return Err(cursor.error("filter 'quote' takes no argument".to_string())),
      _ => return Err(RenderError::UnknownFilter(name.clone())),
    });
  }

  Ok(Expr { path, filters })
}
