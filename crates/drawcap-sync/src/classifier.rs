//! Learns, per lottery/year/weekday, which draw hours actually happen.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use drawcap_core::{Draw, HourBucket};
use serde::{Deserialize, Serialize};

use crate::config::ConditionalHour;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Core,
    Optional,
    Rare,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    Computed,
    Partial,
    Inherited { source_year: i32 },
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarRule {
    pub lottery_key: String,
    pub year: i32,
    pub weekday: Weekday,
    pub core: BTreeSet<HourBucket>,
    pub optional: BTreeSet<HourBucket>,
    pub rare: BTreeSet<HourBucket>,
    pub sample_size: usize,
    pub provenance: Provenance,
}

impl CalendarRule {
    /// Every hour CORE; used when a lottery has no usable history.
    pub fn fallback(lottery_key: &str, date: NaiveDate, hours: &[HourBucket]) -> Self {
        Self {
            lottery_key: lottery_key.to_string(),
            year: date.year(),
            weekday: date.weekday(),
            core: hours.iter().copied().collect(),
            optional: BTreeSet::new(),
            rare: BTreeSet::new(),
            sample_size: 0,
            provenance: Provenance::Fallback,
        }
    }

    /// `None` when the hour is outside this rule's candidate universe.
    pub fn tier(&self, hour: HourBucket) -> Option<Tier> {
        if self.core.contains(&hour) {
            Some(Tier::Core)
        } else if self.optional.contains(&hour) {
            Some(Tier::Optional)
        } else if self.rare.contains(&hour) {
            Some(Tier::Rare)
        } else {
            None
        }
    }

    fn is_trusted_source(&self) -> bool {
        matches!(self.provenance, Provenance::Computed | Provenance::Partial)
    }
}

/// Classifier output for one lottery, persisted between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarTable {
    pub lottery_key: String,
    pub generated_at: DateTime<Utc>,
    pub current_year: i32,
    pub rules: Vec<CalendarRule>,
}

impl CalendarTable {
    pub fn state_key(lottery_key: &str) -> String {
        format!("calendar/{lottery_key}")
    }

    /// Rule for the date's `(year, weekday)`, else the nearest earlier
    /// year's rule for that weekday marked as inherited.
    pub fn rule_for(&self, date: NaiveDate) -> Option<CalendarRule> {
        let (year, weekday) = (date.year(), date.weekday());
        if let Some(rule) = self
            .rules
            .iter()
            .find(|r| r.year == year && r.weekday == weekday)
        {
            return Some(rule.clone());
        }
        self.rules
            .iter()
            .filter(|r| r.weekday == weekday && r.year < year && r.is_trusted_source())
            .max_by_key(|r| r.year)
            .map(|source| CalendarRule {
                year,
                sample_size: 0,
                provenance: Provenance::Inherited {
                    source_year: source.year,
                },
                ..source.clone()
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierConfig {
    pub min_samples_per_group: usize,
    pub min_samples_partial: usize,
    pub core_ratio: f64,
    pub optional_ratio: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_samples_per_group: 8,
            min_samples_partial: 3,
            core_ratio: 0.90,
            optional_ratio: 0.50,
        }
    }
}

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

#[derive(Debug, Clone, Default)]
pub struct CalendarClassifier {
    config: ClassifierConfig,
}

impl CalendarClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        debug_assert!(config.core_ratio >= config.optional_ratio);
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    fn tier_for_ratio(&self, ratio: f64) -> Tier {
        if ratio >= self.config.core_ratio {
            Tier::Core
        } else if ratio >= self.config.optional_ratio {
            Tier::Optional
        } else {
            Tier::Rare
        }
    }

    /// Builds the calendar table from captured draws. Only draws carrying
    /// at least one prize count as an occurrence.
    pub fn classify(
        &self,
        lottery_key: &str,
        candidate_hours: &[HourBucket],
        conditional: &[ConditionalHour],
        draws: &[Draw],
        current_year: i32,
        generated_at: DateTime<Utc>,
    ) -> CalendarTable {
        let mut hours_by_date: HashMap<NaiveDate, BTreeSet<HourBucket>> = HashMap::new();
        for draw in draws
            .iter()
            .filter(|d| d.lottery_key == lottery_key && d.prize_count > 0)
        {
            hours_by_date
                .entry(draw.date)
                .or_default()
                .insert(draw.hour_bucket);
        }

        let mut groups: BTreeMap<(i32, u32), Vec<NaiveDate>> = BTreeMap::new();
        for date in hours_by_date.keys() {
            groups
                .entry((date.year(), date.weekday().num_days_from_monday()))
                .or_default()
                .push(*date);
        }

        let first_year = groups
            .keys()
            .map(|(year, _)| *year)
            .min()
            .unwrap_or(current_year)
            .min(current_year);

        let mut rules: Vec<CalendarRule> = Vec::new();
        for year in first_year..=current_year {
            for weekday in WEEKDAYS {
                let days = groups
                    .get(&(year, weekday.num_days_from_monday()))
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                let sample_size = days.len();

                let trusted = sample_size >= self.config.min_samples_per_group;
                let partial = sample_size >= self.config.min_samples_partial;

                let rule = if trusted || (partial && year == current_year) {
                    let provenance = if trusted {
                        Provenance::Computed
                    } else {
                        Provenance::Partial
                    };
                    Some(self.compute_group(
                        lottery_key,
                        year,
                        weekday,
                        days,
                        &hours_by_date,
                        candidate_hours,
                        conditional,
                        provenance,
                    ))
                } else if let Some(source) = nearest_prior(&rules, year, weekday) {
                    Some(CalendarRule {
                        year,
                        sample_size,
                        provenance: Provenance::Inherited {
                            source_year: source.year,
                        },
                        ..source.clone()
                    })
                } else if partial {
                    Some(self.compute_group(
                        lottery_key,
                        year,
                        weekday,
                        days,
                        &hours_by_date,
                        candidate_hours,
                        conditional,
                        Provenance::Partial,
                    ))
                } else {
                    None
                };
                rules.extend(rule);
            }
        }

        CalendarTable {
            lottery_key: lottery_key.to_string(),
            generated_at,
            current_year,
            rules,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn compute_group(
        &self,
        lottery_key: &str,
        year: i32,
        weekday: Weekday,
        days: &[NaiveDate],
        hours_by_date: &HashMap<NaiveDate, BTreeSet<HourBucket>>,
        candidate_hours: &[HourBucket],
        conditional: &[ConditionalHour],
        provenance: Provenance,
    ) -> CalendarRule {
        let mut rule = CalendarRule {
            lottery_key: lottery_key.to_string(),
            year,
            weekday,
            core: BTreeSet::new(),
            optional: BTreeSet::new(),
            rare: BTreeSet::new(),
            sample_size: days.len(),
            provenance,
        };

        for hour in candidate_hours {
            let cutover = conditional
                .iter()
                .find(|c| c.hour == *hour && c.applies_to(weekday))
                .map(|c| c.active_from);
            let eligible: Vec<&NaiveDate> = days
                .iter()
                .filter(|d| cutover.map_or(true, |from| **d >= from))
                .collect();
            let occurrences = eligible
                .iter()
                .filter(|d| hours_by_date.get(**d).is_some_and(|hours| hours.contains(hour)))
                .count();
            let ratio = if eligible.is_empty() {
                0.0
            } else {
                occurrences as f64 / eligible.len() as f64
            };
            match self.tier_for_ratio(ratio) {
                Tier::Core => rule.core.insert(*hour),
                Tier::Optional => rule.optional.insert(*hour),
                Tier::Rare => rule.rare.insert(*hour),
            };
        }
        rule
    }
}

fn nearest_prior(rules: &[CalendarRule], year: i32, weekday: Weekday) -> Option<&CalendarRule> {
    rules
        .iter()
        .filter(|r| r.weekday == weekday && r.year < year && r.is_trusted_source())
        .max_by_key(|r| r.year)
}
