//! Typed statement vocabulary shared by the remote and local stores.
//!
//! The POS only ever issues a handful of statement shapes: equality
//! selects, row inserts, and `UPDATE .. SET .. WHERE` on a fixed set of
//! tables. Call sites build [`Operation`] values directly; the generic
//! text entry point (`route_sql`) goes through [`parse_statement`], which
//! accepts exactly that vocabulary and rejects everything else with
//! [`CoreError::Parse`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::model::{ChangeAction, ChangeType, NewOrder, OrderStatus};

/// A result row: column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Categories,
    Items,
    Orders,
    OrderItems,
    Admins,
    SyncStatus,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Categories => "categories",
            Self::Items => "items",
            Self::Orders => "orders",
            Self::OrderItems => "order_items",
            Self::Admins => "admins",
            Self::SyncStatus => "sync_status",
        }
    }

    /// Resolve a table name; `menu` is accepted as the legacy name of `categories`.
    pub fn from_name(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "categories" | "menu" => Some(Self::Categories),
            "items" => Some(Self::Items),
            "orders" => Some(Self::Orders),
            "order_items" => Some(Self::OrderItems),
            "admins" => Some(Self::Admins),
            "sync_status" => Some(Self::SyncStatus),
            _ => None,
        }
    }

    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Self::Categories => &["id", "name", "image"],
            Self::Items => &["id", "name", "category_id", "price", "image"],
            Self::Orders => &[
                "id",
                "client_ref",
                "remote_id",
                "table_number",
                "total",
                "status",
                "created_at",
            ],
            Self::OrderItems => &["id", "order_id", "position", "item_id", "quantity", "price"],
            Self::Admins => &["id", "username", "password", "photo"],
            Self::SyncStatus => &["id", "last_sync", "sync_type"],
        }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns().contains(&column)
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// `column = value`; multiple filters are AND-joined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Select {
    pub table: Table,
    /// Empty means every column.
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl Select {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            columns: Vec::new(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            column: column.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, column: &str, descending: bool) -> Self {
        self.order_by = Some(OrderBy {
            column: column.to_string(),
            descending,
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insert {
    pub table: Table,
    pub row: Row,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub table: Table,
    pub set: Row,
    pub filters: Vec<Filter>,
}

/// The closed set of statement shapes the POS issues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Select(Select),
    Insert(Insert),
    Update(Update),
    /// An order and its lines, written as one unit.
    CreateOrder(NewOrder),
}

impl From<Select> for Operation {
    fn from(select: Select) -> Self {
        Self::Select(select)
    }
}

impl From<Insert> for Operation {
    fn from(insert: Insert) -> Self {
        Self::Insert(insert)
    }
}

impl From<Update> for Operation {
    fn from(update: Update) -> Self {
        Self::Update(update)
    }
}

impl Operation {
    pub fn table(&self) -> Table {
        match self {
            Self::Select(s) => s.table,
            Self::Insert(i) => i.table,
            Self::Update(u) => u.table,
            Self::CreateOrder(_) => Table::Orders,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Self::Select(_))
    }

    /// Short description for logs; never includes values.
    pub fn describe(&self) -> String {
        match self {
            Self::Select(s) => format!("SELECT {}", s.table),
            Self::Insert(i) => format!("INSERT {}", i.table),
            Self::Update(u) => format!("UPDATE {}", u.table),
            Self::CreateOrder(_) => "CREATE ORDER".to_string(),
        }
    }

    /// Fill the columns a new order row needs (`client_ref`, `status`,
    /// `created_at`) so every store and every replay sees the same identity.
    pub fn normalized(&self) -> Operation {
        match self {
            Self::Insert(insert) if insert.table == Table::Orders => {
                let mut row = insert.row.clone();
                if !row.get("client_ref").is_some_and(Value::is_string) {
                    row.insert(
                        "client_ref".into(),
                        Value::String(uuid::Uuid::new_v4().to_string()),
                    );
                }
                row.entry("status")
                    .or_insert_with(|| Value::String(OrderStatus::Pending.as_str().into()));
                row.entry("created_at")
                    .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
                Self::Insert(Insert {
                    table: Table::Orders,
                    row,
                })
            }
            other => other.clone(),
        }
    }

    /// Every column named by the operation must belong to its table.
    pub fn check_columns(&self) -> Result<()> {
        let table = self.table();
        let check = |column: &str| {
            if table.has_column(column) {
                Ok(())
            } else {
                Err(CoreError::unsupported(format!(
                    "unknown column `{column}` on {table}"
                )))
            }
        };
        match self {
            Self::Select(s) => {
                s.columns.iter().try_for_each(|c| check(c))?;
                s.filters.iter().try_for_each(|f| check(&f.column))?;
                if let Some(order) = &s.order_by {
                    check(&order.column)?;
                }
                Ok(())
            }
            Self::Insert(i) => i.row.keys().try_for_each(|c| check(c)),
            Self::Update(u) => {
                u.set.keys().try_for_each(|c| check(c))?;
                u.filters.iter().try_for_each(|f| check(&f.column))
            }
            Self::CreateOrder(_) => Ok(()),
        }
    }

    /// Which pending change a fallback execution of this operation records.
    ///
    /// `Ok(None)` for reads. Operations the local interpreter must not run
    /// (reference-data inserts, unfiltered updates, order line edits,
    /// bookkeeping tables) return [`CoreError::UnsupportedFallbackQuery`].
    pub fn fallback_change(&self) -> Result<Option<(ChangeType, ChangeAction)>> {
        match self {
            Self::Select(_) => Ok(None),
            Self::CreateOrder(_) => Ok(Some((ChangeType::Order, ChangeAction::Create))),
            Self::Insert(insert) => match insert.table {
                Table::Orders => Ok(Some((ChangeType::Order, ChangeAction::Create))),
                Table::OrderItems => Ok(Some((ChangeType::OrderItem, ChangeAction::Create))),
                other => Err(CoreError::unsupported(format!(
                    "INSERT into {other} requires the central server"
                ))),
            },
            Self::Update(update) => {
                if update.filters.is_empty() {
                    return Err(CoreError::unsupported("UPDATE without WHERE"));
                }
                if update.set.is_empty() {
                    return Err(CoreError::unsupported("UPDATE without SET columns"));
                }
                let change_type = match update.table {
                    Table::Orders => ChangeType::Order,
                    // Line ids are never mapped to remote ids, so an edit
                    // replayed later could land on another terminal's lines.
                    Table::OrderItems => {
                        return Err(CoreError::unsupported(
                            "UPDATE order_items requires the central server",
                        ))
                    }
                    Table::Categories | Table::Items => ChangeType::MenuUpdate,
                    Table::Admins => ChangeType::AdminUpdate,
                    Table::SyncStatus => {
                        return Err(CoreError::unsupported(
                            "sync_status is local bookkeeping and cannot be updated",
                        ))
                    }
                };
                Ok(Some((change_type, ChangeAction::Update)))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryResult {
    Rows(Vec<Row>),
    Inserted {
        #[serde(rename = "insertId")]
        insert_id: i64,
    },
    Updated {
        affected: u64,
    },
}

impl QueryResult {
    /// Rows of a select; an integrity error for any other result.
    pub fn into_rows(self) -> Result<Vec<Row>> {
        match self {
            Self::Rows(rows) => Ok(rows),
            other => Err(CoreError::integrity(format!(
                "expected rows, got {other:?}"
            ))),
        }
    }

    pub fn insert_id(&self) -> Option<i64> {
        match self {
            Self::Inserted { insert_id } => Some(*insert_id),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Statement text parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(Value),
    Placeholder,
    Comma,
    LParen,
    RParen,
    Eq,
    Star,
    Semicolon,
}

fn tokenize(sql: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Eq);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '?' => {
                tokens.push(Token::Placeholder);
                i += 1;
            }
            ';' => {
                tokens.push(Token::Semicolon);
                i += 1;
            }
            '\'' | '"' => {
                // String literal; a doubled quote escapes itself.
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(CoreError::parse("unterminated string literal")),
                        Some(&ch) if ch == quote => {
                            if chars.get(i + 1) == Some(&quote) {
                                text.push(quote);
                                i += 2;
                            } else {
                                i += 1;
                                break;
                            }
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            '`' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == '`')
                    .map(|p| start + p)
                    .ok_or_else(|| CoreError::parse("unterminated quoted identifier"))?;
                tokens.push(Token::Ident(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Num(parse_number(&text)?));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(CoreError::parse(format!("unexpected character `{other}`"))),
        }
    }

    Ok(tokens)
}

fn parse_number(text: &str) -> Result<Value> {
    if text.contains('.') {
        text.parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| CoreError::parse(format!("invalid number `{text}`")))
    } else {
        text.parse::<i64>()
            .map(Value::from)
            .map_err(|_| CoreError::parse(format!("invalid number `{text}`")))
    }
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    params: &'a [Value],
    next_param: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(word)) if word.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(CoreError::parse(format!(
                "expected {keyword}, found {}",
                self.describe_next()
            )))
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(CoreError::parse(format!(
                "expected {expected:?}, found {token:?}"
            ))),
            None => Err(CoreError::parse(format!(
                "expected {expected:?}, found end of statement"
            ))),
        }
    }

    fn describe_next(&self) -> String {
        match self.peek() {
            Some(token) => format!("{token:?}"),
            None => "end of statement".to_string(),
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.advance() {
            Some(Token::Ident(name)) => Ok(name),
            Some(token) => Err(CoreError::parse(format!(
                "expected identifier, found {token:?}"
            ))),
            None => Err(CoreError::parse("expected identifier, found end of statement")),
        }
    }

    fn table(&mut self) -> Result<Table> {
        let name = self.ident()?;
        Table::from_name(&name).ok_or_else(|| CoreError::parse(format!("unknown table `{name}`")))
    }

    fn column(&mut self, table: Table) -> Result<String> {
        let name = self.ident()?.to_ascii_lowercase();
        if table.has_column(&name) {
            Ok(name)
        } else {
            Err(CoreError::parse(format!("unknown column `{name}` on {table}")))
        }
    }

    fn value(&mut self) -> Result<Value> {
        match self.advance() {
            Some(Token::Placeholder) => {
                let value = self.params.get(self.next_param).cloned().ok_or_else(|| {
                    CoreError::parse(format!(
                        "statement uses more placeholders than the {} parameter(s) given",
                        self.params.len()
                    ))
                })?;
                self.next_param += 1;
                Ok(value)
            }
            Some(Token::Str(text)) => Ok(Value::String(text)),
            Some(Token::Num(value)) => Ok(value),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("null") => Ok(Value::Null),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("false") => {
                Ok(Value::Bool(false))
            }
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("now") => {
                self.expect(Token::LParen)?;
                self.expect(Token::RParen)?;
                Ok(Value::String(Utc::now().to_rfc3339()))
            }
            Some(token) => Err(CoreError::parse(format!("expected a value, found {token:?}"))),
            None => Err(CoreError::parse("expected a value, found end of statement")),
        }
    }

    /// `col = value [AND col = value]*`; a literal tautology such as `1=1` is skipped.
    fn conditions(&mut self, table: Table) -> Result<Vec<Filter>> {
        let mut filters = Vec::new();
        loop {
            if let Some(Token::Num(lhs)) = self.peek().cloned() {
                self.pos += 1;
                self.expect(Token::Eq)?;
                let rhs = self.value()?;
                if rhs != lhs {
                    return Err(CoreError::parse("only equality on columns is supported"));
                }
            } else {
                let column = self.column(table)?;
                self.expect(Token::Eq)?;
                let value = self.value()?;
                filters.push(Filter { column, value });
            }
            if !self.eat_keyword("and") {
                return Ok(filters);
            }
        }
    }

    fn select(&mut self) -> Result<Operation> {
        let mut raw_columns = Vec::new();
        if self.peek() == Some(&Token::Star) {
            self.pos += 1;
        } else {
            loop {
                raw_columns.push(self.ident()?.to_ascii_lowercase());
                if self.peek() != Some(&Token::Comma) {
                    break;
                }
                self.pos += 1;
            }
        }
        self.expect_keyword("from")?;
        let table = self.table()?;
        if let Some(unknown) = raw_columns.iter().find(|c| !table.has_column(c)) {
            return Err(CoreError::parse(format!(
                "unknown column `{unknown}` on {table}"
            )));
        }

        let mut select = Select::new(table);
        select.columns = raw_columns;
        if self.eat_keyword("where") {
            select.filters = self.conditions(table)?;
        }
        if self.eat_keyword("order") {
            self.expect_keyword("by")?;
            let column = self.column(table)?;
            let descending = if self.eat_keyword("desc") {
                true
            } else {
                self.eat_keyword("asc");
                false
            };
            select.order_by = Some(OrderBy { column, descending });
        }
        if self.eat_keyword("limit") {
            match self.value()? {
                Value::Number(n) => {
                    let limit = n
                        .as_u64()
                        .and_then(|v| u32::try_from(v).ok())
                        .ok_or_else(|| CoreError::parse("LIMIT must be a small positive integer"))?;
                    select.limit = Some(limit);
                }
                other => {
                    return Err(CoreError::parse(format!(
                        "LIMIT must be a number, found {other}"
                    )))
                }
            }
        }
        Ok(Operation::Select(select))
    }

    fn insert(&mut self) -> Result<Operation> {
        self.expect_keyword("into")?;
        let table = self.table()?;
        self.expect(Token::LParen)?;
        let mut columns = Vec::new();
        loop {
            columns.push(self.column(table)?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                _ => return Err(CoreError::parse("malformed INSERT column list")),
            }
        }
        self.expect_keyword("values")?;
        self.expect(Token::LParen)?;
        let mut values = Vec::new();
        loop {
            values.push(self.value()?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                _ => return Err(CoreError::parse("malformed INSERT value list")),
            }
        }
        if columns.len() != values.len() {
            return Err(CoreError::parse(format!(
                "INSERT names {} column(s) but supplies {} value(s)",
                columns.len(),
                values.len()
            )));
        }
        let row: Row = columns.into_iter().zip(values).collect();
        Ok(Operation::Insert(Insert { table, row }))
    }

    fn update(&mut self) -> Result<Operation> {
        let table = self.table()?;
        self.expect_keyword("set")?;
        let mut set = Row::new();
        loop {
            let column = self.column(table)?;
            self.expect(Token::Eq)?;
            let value = self.value()?;
            set.insert(column, value);
            if self.peek() != Some(&Token::Comma) {
                break;
            }
            self.pos += 1;
        }
        if !self.eat_keyword("where") {
            return Err(CoreError::parse("UPDATE without WHERE is not supported"));
        }
        let filters = self.conditions(table)?;
        Ok(Operation::Update(Update {
            table,
            set,
            filters,
        }))
    }
}

/// Parse one statement of the supported vocabulary, binding `?` placeholders
/// to `params` in order.
pub fn parse_statement(sql: &str, params: &[Value]) -> Result<Operation> {
    let mut parser = Parser {
        tokens: tokenize(sql)?,
        pos: 0,
        params,
        next_param: 0,
    };

    let operation = if parser.eat_keyword("select") {
        parser.select()?
    } else if parser.eat_keyword("insert") {
        parser.insert()?
    } else if parser.eat_keyword("update") {
        parser.update()?
    } else {
        return Err(CoreError::parse(format!(
            "unsupported statement starting with {}",
            parser.describe_next()
        )));
    };

    if parser.peek() == Some(&Token::Semicolon) {
        parser.pos += 1;
    }
    if parser.pos < parser.tokens.len() {
        return Err(CoreError::parse(format!(
            "unexpected trailing {}",
            parser.describe_next()
        )));
    }
    if parser.next_param != params.len() {
        return Err(CoreError::parse(format!(
            "statement binds {} placeholder(s) but {} parameter(s) were given",
            parser.next_param,
            params.len()
        )));
    }

    Ok(operation)
}
