use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::backend::{Column, Direction};
use crate::core::InvalidInput;

/// Ordering of a list call. Ties are always broken by key ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    KeyAsc,
    KeyDesc,
    CreatedAsc,
    CreatedDesc,
    UpdatedAsc,
    UpdatedDesc,
}

impl SortKey {
    pub const ALL: [SortKey; 6] = [
        SortKey::KeyAsc,
        SortKey::KeyDesc,
        SortKey::CreatedAsc,
        SortKey::CreatedDesc,
        SortKey::UpdatedAsc,
        SortKey::UpdatedDesc,
    ];

    pub fn token(&self) -> &'static str {
        match self {
            Self::KeyAsc => "key_asc",
            Self::KeyDesc => "key_desc",
            Self::CreatedAsc => "created_asc",
            Self::CreatedDesc => "created_desc",
            Self::UpdatedAsc => "updated_asc",
            Self::UpdatedDesc => "updated_desc",
        }
    }

    pub fn column(&self) -> Column {
        match self {
            Self::KeyAsc | Self::KeyDesc => Column::Id,
            Self::CreatedAsc | Self::CreatedDesc => Column::CreatedAt,
            Self::UpdatedAsc | Self::UpdatedDesc => Column::UpdatedAt,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Self::KeyAsc | Self::CreatedAsc | Self::UpdatedAsc => Direction::Asc,
            Self::KeyDesc | Self::CreatedDesc | Self::UpdatedDesc => Direction::Desc,
        }
    }

    /// Comma-separated list of every accepted token.
    pub fn accepted_tokens() -> String {
        Self::ALL
            .iter()
            .map(SortKey::token)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromStr for SortKey {
    type Err = InvalidInput;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|key| key.token() == s)
            .ok_or_else(|| InvalidInput::UnknownSort {
                got: s.to_string(),
                accepted: Self::accepted_tokens(),
            })
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Starts-with filter on the record key. The prefix is matched literally
/// against the canonical lowercase key form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFilter {
    prefix: Option<String>,
}

impl KeyFilter {
    pub fn none() -> Self {
        Self::default()
    }

    /// An empty prefix matches everything and is the same as no filter.
    /// Keys are stored lowercase, so the prefix is lowercased too.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into().to_ascii_lowercase();
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
        }
    }

    pub fn as_prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    /// `None` returns every matching row.
    pub limit: Option<u32>,
    /// `None` means zero.
    pub offset: Option<u32>,
}

impl Page {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self { limit, offset }
    }

    pub fn offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }
}

/// List parameters as they arrive from the outside, unparsed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawListParams {
    pub limit: Option<String>,
    pub offset: Option<String>,
    pub prefix: Option<String>,
    pub sort: Option<String>,
}

/// Validated list parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
    pub filter: KeyFilter,
    pub sort: SortKey,
    pub page: Page,
}

impl ListParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.filter = KeyFilter::prefix(prefix);
        self
    }

    pub fn with_sort(mut self, sort: SortKey) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.page.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.page.offset = Some(offset);
        self
    }

    pub fn from_raw(raw: &RawListParams) -> Result<Self, InvalidInput> {
        let sort = match raw.sort.as_deref() {
            Some(token) => token.parse()?,
            None => SortKey::default(),
        };
        let limit = raw
            .limit
            .as_deref()
            .map(|v| parse_pagination("limit", v))
            .transpose()?;
        let offset = raw
            .offset
            .as_deref()
            .map(|v| parse_pagination("offset", v))
            .transpose()?;
        let filter = raw
            .prefix
            .as_deref()
            .map(KeyFilter::prefix)
            .unwrap_or_default();

        Ok(Self {
            filter,
            sort,
            page: Page::new(limit, offset),
        })
    }
}

fn parse_pagination(param: &'static str, value: &str) -> Result<u32, InvalidInput> {
    let trimmed = value.trim();
    if trimmed.starts_with('-') {
        return Err(InvalidInput::NegativePagination {
            param,
            value: value.to_string(),
        });
    }
    trimmed
        .parse::<u32>()
        .map_err(|_| InvalidInput::MalformedPagination {
            param,
            value: value.to_string(),
            max: u32::MAX,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(limit: Option<&str>, offset: Option<&str>, prefix: Option<&str>, sort: Option<&str>) -> RawListParams {
        RawListParams {
            limit: limit.map(str::to_string),
            offset: offset.map(str::to_string),
            prefix: prefix.map(str::to_string),
            sort: sort.map(str::to_string),
        }
    }

    #[test]
    fn test_every_token_parses_back() {
        for key in SortKey::ALL {
            assert_eq!(key.token().parse::<SortKey>().unwrap(), key);
            assert_eq!(key.to_string(), key.token());
        }
        assert_eq!(SortKey::default(), SortKey::KeyAsc);
    }

    #[test]
    fn test_unknown_sort_lists_accepted_tokens() {
        let err = "bogus".parse::<SortKey>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "sort must be one of: key_asc, key_desc, created_asc, created_desc, updated_asc, updated_desc, got 'bogus'"
        );
        assert!("KEY_ASC".parse::<SortKey>().is_err());
    }

    #[test]
    fn test_sort_maps_to_column_and_direction() {
        assert_eq!(SortKey::CreatedDesc.column(), Column::CreatedAt);
        assert_eq!(SortKey::CreatedDesc.direction(), Direction::Desc);
        assert_eq!(SortKey::KeyAsc.column(), Column::Id);
        assert_eq!(SortKey::UpdatedAsc.direction(), Direction::Asc);
    }

    #[test]
    fn test_from_raw_defaults() {
        let params = ListParams::from_raw(&RawListParams::default()).unwrap();
        assert_eq!(params, ListParams::new());
        assert_eq!(params.page.offset(), 0);
        assert_eq!(params.page.limit, None);
    }

    #[test]
    fn test_from_raw_parses_everything() {
        let params =
            ListParams::from_raw(&raw(Some("2"), Some("1"), Some("abc"), Some("updated_desc")))
                .unwrap();
        assert_eq!(params.page, Page::new(Some(2), Some(1)));
        assert_eq!(params.filter.as_prefix(), Some("abc"));
        assert_eq!(params.sort, SortKey::UpdatedDesc);
    }

    #[test]
    fn test_empty_prefix_is_no_filter() {
        let params = ListParams::from_raw(&raw(None, None, Some(""), None)).unwrap();
        assert_eq!(params.filter, KeyFilter::none());
    }

    #[test]
    fn test_prefix_is_lowercased() {
        assert_eq!(KeyFilter::prefix("550E84").as_prefix(), Some("550e84"));
        let params = ListParams::from_raw(&raw(None, None, Some("ABC-"), None)).unwrap();
        assert_eq!(params.filter.as_prefix(), Some("abc-"));
    }

    #[test]
    fn test_bad_pagination_is_rejected() {
        assert!(matches!(
            ListParams::from_raw(&raw(Some("-1"), None, None, None)),
            Err(InvalidInput::NegativePagination { param: "limit", .. })
        ));
        assert!(matches!(
            ListParams::from_raw(&raw(None, Some("ten"), None, None)),
            Err(InvalidInput::MalformedPagination { param: "offset", .. })
        ));
        assert!(matches!(
            ListParams::from_raw(&raw(Some("4294967296"), None, None, None)),
            Err(InvalidInput::MalformedPagination { .. })
        ));
    }
}
