use serde::{Deserialize, Serialize};
use utoipa::IntoParams;

pub const DEFAULT_PER_PAGE: u32 = 20;
pub const MAX_PER_PAGE: u32 = 100;

#[derive(Debug, Default, Clone, Copy, Deserialize, IntoParams)]
pub struct PageQuery {
    /// Page number, starting with 1
    pub page: Option<u32>,
    /// Items per page (max 100)
    pub per_page: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Page {
    pub page: u32,
    pub per_page: u32,
}

impl Page {
    pub fn new(page: Option<u32>, per_page: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            per_page: per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE),
        }
    }

    pub fn limit(&self) -> i64 {
        self.per_page as i64
    }

    pub fn offset(&self) -> i64 {
        (self.page as i64 - 1) * self.per_page as i64
    }
}

impl From<PageQuery> for Page {
    fn from(q: PageQuery) -> Self {
        Page::new(q.page, q.per_page)
    }
}

#[derive(Debug, Serialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total: i64,
}

impl<T> Paginated<T> {
    pub fn new(data: Vec<T>, page: Page, total: i64) -> Self {
        Self {
            data,
            page: page.page,
            per_page: page.per_page,
            total,
        }
    }
}

/// Typed bind values for dynamically built WHERE clauses.
#[derive(Debug, Clone)]
pub enum FilterValue {
    U64(u64),
    Bool(bool),
    Str(String),
    Date(chrono::NaiveDate),
}

/// Accumulates `AND`-joined conditions with their bind values.
#[derive(Debug, Default)]
pub struct Filter {
    conditions: Vec<String>,
    pub args: Vec<FilterValue>,
}

impl Filter {
    pub fn push(&mut self, condition: &str, value: FilterValue) {
        self.conditions.push(condition.to_string());
        self.args.push(value);
    }

    /// Case-insensitive substring match over several columns.
    pub fn search(&mut self, columns: &[&str], term: &str) {
        let term = term.trim();
        if term.is_empty() {
            return;
        }
        let like = format!("%{}%", term.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_"));
        let clause = columns
            .iter()
            .map(|c| format!("{c} LIKE ?"))
            .collect::<Vec<_>>()
            .join(" OR ");
        self.conditions.push(format!("({clause})"));
        for _ in columns {
            self.args.push(FilterValue::Str(like.clone()));
        }
    }

    pub fn raw(&mut self, condition: &str) {
        self.conditions.push(condition.to_string());
    }

    pub fn where_clause(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conditions.join(" AND "))
        }
    }
}

/// Bind every filter argument to a sqlx query, in order.
macro_rules! bind_filters {
    ($query:expr, $args:expr) => {{
        let mut q = $query;
        for arg in $args.iter() {
            q = match arg {
                $crate::utils::pagination::FilterValue::U64(v) => q.bind(*v),
                $crate::utils::pagination::FilterValue::Bool(v) => q.bind(*v),
                $crate::utils::pagination::FilterValue::Str(v) => q.bind(v.clone()),
                $crate::utils::pagination::FilterValue::Date(v) => q.bind(*v),
            };
        }
        q
    }};
}

pub(crate) use bind_filters;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_is_clamped() {
        assert_eq!(Page::new(None, None), Page { page: 1, per_page: 20 });
        assert_eq!(Page::new(Some(0), Some(1000)), Page { page: 1, per_page: 100 });
        assert_eq!(Page::new(Some(3), Some(0)).per_page, 1);
    }

    #[test]
    fn offset_follows_page() {
        let page = Page::new(Some(3), Some(10));
        assert_eq!(page.offset(), 20);
        assert_eq!(page.limit(), 10);
    }

    #[test]
    fn empty_filter_has_no_where() {
        assert_eq!(Filter::default().where_clause(), "");
    }

    #[test]
    fn search_expands_to_one_bind_per_column() {
        let mut f = Filter::default();
        f.push("status = ?", FilterValue::Str("new".into()));
        f.search(&["name", "email"], " 50%_off ");

        assert_eq!(f.where_clause(), " WHERE status = ? AND (name LIKE ? OR email LIKE ?)");
        assert_eq!(f.args.len(), 3);
        match &f.args[1] {
            FilterValue::Str(s) => assert_eq!(s, "%50\\%\\_off%"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn blank_search_is_ignored() {
        let mut f = Filter::default();
        f.search(&["name"], "   ");
        assert_eq!(f.where_clause(), "");
        assert!(f.args.is_empty());
    }
}
