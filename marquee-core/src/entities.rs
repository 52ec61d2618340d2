//! Catalog documents owned by the TvShow → Season → Episode aggregate.
//!
//! These are plain data. Counters (`popularity`, `rating_sum`,
//! `rating_count`) are only ever changed by store-side increments, never by
//! writing back a value computed in the application.

use crate::{EpisodeId, SeasonId, Timestamp, TvShowId, ValidationError};
use serde::{Deserialize, Serialize};

/// A TV show, root of the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TvShow {
    pub tv_show_id: TvShowId,
    pub title: String,
    pub overview: Option<String>,
    /// Incremented once per episode created under this show.
    pub popularity: i64,
    /// Season ids in insertion order.
    pub seasons: Vec<SeasonId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// A season of a TV show.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Season {
    pub season_id: SeasonId,
    pub tv_show_id: TvShowId,
    pub season_number: i32,
    pub title: String,
    /// Episode ids in insertion order.
    pub episodes: Vec<EpisodeId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// A single episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub episode_id: EpisodeId,
    pub season_id: SeasonId,
    pub tv_show_id: TvShowId,
    pub episode_number: i32,
    pub title: String,
    pub runtime_minutes: Option<i32>,
    /// Sum of all submitted scores.
    pub rating_sum: i64,
    /// Number of submitted scores.
    pub rating_count: i64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Episode {
    /// Average rating, derived at read time from the running sum and count.
    pub fn average_rating(&self) -> Option<f64> {
        if self.rating_count == 0 {
            None
        } else {
            Some(self.rating_sum as f64 / self.rating_count as f64)
        }
    }
}

/// A season read model with its episodes populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonWithEpisodes {
    pub season: Season,
    pub episodes: Vec<Episode>,
}

// ============================================================================
// WRITE PAYLOADS
// ============================================================================

/// Payload for creating a TV show.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTvShow {
    pub title: String,
    pub overview: Option<String>,
}

/// Payload for creating a season under an existing show.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSeason {
    pub tv_show_id: TvShowId,
    pub season_number: i32,
    pub title: String,
}

/// Payload for creating an episode under an existing season.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEpisode {
    pub season_id: SeasonId,
    pub episode_number: i32,
    pub title: String,
    pub runtime_minutes: Option<i32>,
}

/// Partial update for an episode. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeUpdate {
    pub title: Option<String>,
    pub runtime_minutes: Option<i32>,
}

/// Inclusive bounds for a submitted rating score.
pub const MIN_RATING: i64 = 1;
pub const MAX_RATING: i64 = 10;

fn require_title(title: &str) -> Result<(), ValidationError> {
    if title.trim().is_empty() {
        return Err(ValidationError::RequiredFieldMissing {
            field: "title".to_string(),
        });
    }
    Ok(())
}

fn require_positive(field: &str, value: i32) -> Result<(), ValidationError> {
    if value < 1 {
        return Err(ValidationError::InvalidValue {
            field: field.to_string(),
            reason: format!("must be at least 1, got {value}"),
        });
    }
    Ok(())
}

impl NewTvShow {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_title(&self.title)
    }
}

impl NewSeason {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_title(&self.title)?;
        require_positive("season_number", self.season_number)
    }
}

impl NewEpisode {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_title(&self.title)?;
        require_positive("episode_number", self.episode_number)?;
        if let Some(runtime) = self.runtime_minutes {
            require_positive("runtime_minutes", runtime)?;
        }
        Ok(())
    }
}

impl EpisodeUpdate {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(title) = &self.title {
            require_title(title)?;
        }
        if let Some(runtime) = self.runtime_minutes {
            require_positive("runtime_minutes", runtime)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.runtime_minutes.is_none()
    }
}

/// Validate a submitted rating score.
pub fn validate_rating(score: i64) -> Result<(), ValidationError> {
    if !(MIN_RATING..=MAX_RATING).contains(&score) {
        return Err(ValidationError::InvalidValue {
            field: "score".to_string(),
            reason: format!("must be between {MIN_RATING} and {MAX_RATING}, got {score}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn episode_with_ratings(sum: i64, count: i64) -> Episode {
        Episode {
            episode_id: Uuid::now_v7(),
            season_id: Uuid::now_v7(),
            tv_show_id: Uuid::now_v7(),
            episode_number: 1,
            title: "Pilot".to_string(),
            runtime_minutes: Some(42),
            rating_sum: sum,
            rating_count: count,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_average_rating_derived_from_sum_and_count() {
        assert_eq!(episode_with_ratings(0, 0).average_rating(), None);
        assert_eq!(episode_with_ratings(17, 2).average_rating(), Some(8.5));
    }

    #[test]
    fn test_new_episode_validation() {
        let ok = NewEpisode {
            season_id: Uuid::now_v7(),
            episode_number: 1,
            title: "Pilot".to_string(),
            runtime_minutes: None,
        };
        assert!(ok.validate().is_ok());

        let blank = NewEpisode {
            title: "  ".to_string(),
            ..ok.clone()
        };
        assert!(matches!(
            blank.validate(),
            Err(ValidationError::RequiredFieldMissing { .. })
        ));

        let zero = NewEpisode {
            episode_number: 0,
            ..ok
        };
        assert!(matches!(
            zero.validate(),
            Err(ValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_rating_bounds() {
        assert!(validate_rating(MIN_RATING).is_ok());
        assert!(validate_rating(MAX_RATING).is_ok());
        assert!(validate_rating(0).is_err());
        assert!(validate_rating(11).is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(200))]

            #[test]
            fn prop_rating_accepted_only_in_bounds(score in any::<i64>()) {
                let in_bounds = (MIN_RATING..=MAX_RATING).contains(&score);
                prop_assert_eq!(validate_rating(score).is_ok(), in_bounds);
            }

            /// The derived average always lies within the score bounds.
            #[test]
            fn prop_average_within_bounds(scores in prop::collection::vec(MIN_RATING..=MAX_RATING, 1..50)) {
                let sum: i64 = scores.iter().sum();
                let episode = episode_with_ratings(sum, scores.len() as i64);
                let average = episode.average_rating().unwrap();
                prop_assert!(average >= MIN_RATING as f64 && average <= MAX_RATING as f64);
            }
        }
    }
}
