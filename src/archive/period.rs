//! Archive tiers and period keys
//!
//! Key formats: `YYYY-MM-DD`, `YYYY-Www` (ISO week), `YYYY-MM`, `YYYY-Qn`, `YYYY`.
//! Keys of one tier sort chronologically as strings.

use crate::error::{FeedError, Result};
use chrono::{Datelike, Duration, Months, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl Tier {
    pub const ALL: [Tier; 5] = [Tier::Daily, Tier::Weekly, Tier::Monthly, Tier::Quarterly, Tier::Yearly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Daily => "daily",
            Tier::Weekly => "weekly",
            Tier::Monthly => "monthly",
            Tier::Quarterly => "quarterly",
            Tier::Yearly => "yearly",
        }
    }

    pub fn collection(&self) -> String {
        format!("archive/{}", self.as_str())
    }

    /// Tier this one rolls up into
    pub fn coarser(&self) -> Option<Tier> {
        match self {
            Tier::Daily => Some(Tier::Weekly),
            Tier::Weekly => Some(Tier::Monthly),
            Tier::Monthly => Some(Tier::Quarterly),
            Tier::Quarterly => Some(Tier::Yearly),
            Tier::Yearly => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self> {
        Tier::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| FeedError::Validation(format!("unknown archive tier '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Period {
    Day(NaiveDate),
    Week { year: i32, week: u32 },
    Month { year: i32, month: u32 },
    Quarter { year: i32, quarter: u32 },
    Year(i32),
}

fn invalid(tier: Tier, key: &str) -> FeedError {
    FeedError::Validation(format!("'{}' is not a {} period key", key, tier))
}

fn month_start(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
}

impl Period {
    pub fn week_of(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        Period::Week {
            year: iso.year(),
            week: iso.week(),
        }
    }

    pub fn tier(&self) -> Tier {
        match self {
            Period::Day(_) => Tier::Daily,
            Period::Week { .. } => Tier::Weekly,
            Period::Month { .. } => Tier::Monthly,
            Period::Quarter { .. } => Tier::Quarterly,
            Period::Year(_) => Tier::Yearly,
        }
    }

    pub fn key(&self) -> String {
        match *self {
            Period::Day(date) => date.format("%Y-%m-%d").to_string(),
            Period::Week { year, week } => format!("{:04}-W{:02}", year, week),
            Period::Month { year, month } => format!("{:04}-{:02}", year, month),
            Period::Quarter { year, quarter } => format!("{:04}-Q{}", year, quarter),
            Period::Year(year) => format!("{:04}", year),
        }
    }

    /// Parse a canonical key of `tier`
    pub fn parse(tier: Tier, key: &str) -> Result<Self> {
        let period = match tier {
            Tier::Daily => NaiveDate::parse_from_str(key, "%Y-%m-%d")
                .map(Period::Day)
                .map_err(|_| invalid(tier, key))?,
            Tier::Weekly => {
                let (year, week) = key.split_once("-W").ok_or_else(|| invalid(tier, key))?;
                let year: i32 = year.parse().map_err(|_| invalid(tier, key))?;
                let week: u32 = week.parse().map_err(|_| invalid(tier, key))?;
                NaiveDate::from_isoywd_opt(year, week, Weekday::Mon).ok_or_else(|| invalid(tier, key))?;
                Period::Week { year, week }
            }
            Tier::Monthly => {
                let (year, month) = key.split_once('-').ok_or_else(|| invalid(tier, key))?;
                let year: i32 = year.parse().map_err(|_| invalid(tier, key))?;
                let month: u32 = month.parse().map_err(|_| invalid(tier, key))?;
                month_start(year, month).ok_or_else(|| invalid(tier, key))?;
                Period::Month { year, month }
            }
            Tier::Quarterly => {
                let (year, quarter) = key.split_once("-Q").ok_or_else(|| invalid(tier, key))?;
                let year: i32 = year.parse().map_err(|_| invalid(tier, key))?;
                let quarter: u32 = quarter.parse().map_err(|_| invalid(tier, key))?;
                if !(1..=4).contains(&quarter) {
                    return Err(invalid(tier, key));
                }
                Period::Quarter { year, quarter }
            }
            Tier::Yearly => Period::Year(key.parse().map_err(|_| invalid(tier, key))?),
        };

        if period.key() != key {
            return Err(invalid(tier, key));
        }
        Ok(period)
    }

    /// Enclosing period one tier up
    pub fn parent(&self) -> Option<Period> {
        match *self {
            Period::Day(date) => Some(Period::week_of(date)),
            Period::Week { year, week } => {
                // A week belongs to the month holding its Thursday
                let thursday = NaiveDate::from_isoywd_opt(year, week, Weekday::Thu)?;
                Some(Period::Month {
                    year: thursday.year(),
                    month: thursday.month(),
                })
            }
            Period::Month { year, month } => Some(Period::Quarter {
                year,
                quarter: (month - 1) / 3 + 1,
            }),
            Period::Quarter { year, .. } => Some(Period::Year(year)),
            Period::Year(_) => None,
        }
    }

    /// Every period one tier down that rolls up into this one
    pub fn children(&self) -> Vec<Period> {
        match *self {
            Period::Day(_) => Vec::new(),
            Period::Week { year, week } => match NaiveDate::from_isoywd_opt(year, week, Weekday::Mon) {
                Some(monday) => (0..7).map(|d| Period::Day(monday + Duration::days(d))).collect(),
                None => Vec::new(),
            },
            Period::Month { year, month } => {
                let Some(first) = month_start(year, month) else {
                    return Vec::new();
                };
                let offset = (7 + Weekday::Thu.num_days_from_monday() - first.weekday().num_days_from_monday()) % 7;
                let mut thursday = first + Duration::days(offset as i64);
                let mut weeks = Vec::new();
                while thursday.month() == month {
                    weeks.push(Period::week_of(thursday));
                    thursday += Duration::days(7);
                }
                weeks
            }
            Period::Quarter { year, quarter } => (1..=3)
                .map(|i| Period::Month {
                    year,
                    month: (quarter - 1) * 3 + i,
                })
                .collect(),
            Period::Year(year) => (1..=4).map(|quarter| Period::Quarter { year, quarter }).collect(),
        }
    }

    pub fn first_day(&self) -> Option<NaiveDate> {
        match *self {
            Period::Day(date) => Some(date),
            Period::Week { year, week } => NaiveDate::from_isoywd_opt(year, week, Weekday::Mon),
            _ => self.children().first()?.first_day(),
        }
    }

    /// Last calendar day covered by this period's children
    pub fn last_day(&self) -> Option<NaiveDate> {
        match *self {
            Period::Day(date) => Some(date),
            Period::Week { year, week } => NaiveDate::from_isoywd_opt(year, week, Weekday::Sun),
            _ => self.children().last()?.last_day(),
        }
    }

    /// True once every day of the period lies before `today`
    pub fn is_closed(&self, today: NaiveDate) -> bool {
        self.last_day().is_some_and(|last| last < today)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Earliest first day a finer entry may have before its parent is rolled up without it
pub(crate) fn retention_cutoff(tier: Tier, today: NaiveDate, config: &crate::config::ArchiveConfig) -> NaiveDate {
    let cutoff = match tier {
        Tier::Daily => today.checked_sub_signed(Duration::days(config.daily_retention_days)),
        Tier::Weekly => today.checked_sub_signed(Duration::weeks(config.weekly_retention_weeks)),
        Tier::Monthly => today.checked_sub_months(Months::new(config.monthly_retention_months.max(0) as u32)),
        Tier::Quarterly => {
            today.checked_sub_months(Months::new((config.quarterly_retention_years.max(0) * 12) as u32))
        }
        Tier::Yearly => None,
    };
    cutoff.unwrap_or(NaiveDate::MIN)
}
