//! Block selection policies.
//!
//! A [`SelectionPolicy`] decides which of several free blocks large enough
//! for a request is handed out. The allocators filter their free-space index
//! down to qualifying candidates and let the policy pick one.
//!
//! | Policy     | Picks                                   |
//! |------------|-----------------------------------------|
//! | `FirstFit` | the first candidate in index order      |
//! | `BestFit`  | the smallest candidate (first on ties)  |
//! | `WorstFit` | the largest candidate (first on ties)   |

use core::str::FromStr;

use crate::error::{ParsePolicyError, ParsePolicySnafu};

#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    derive_more::Display,
    derive_more::IsVariant,
)]
pub enum SelectionPolicy {
    #[default]
    #[display("first-fit")]
    FirstFit,
    #[display("best-fit")]
    BestFit,
    #[display("worst-fit")]
    WorstFit,
}

impl SelectionPolicy {
    pub const ALL: [Self; 3] = [Self::FirstFit, Self::BestFit, Self::WorstFit];

    /// Chooses one of `candidates`, each a `(key, size)` pair of a block that
    /// already satisfies the request.
    ///
    /// Returns the key of the chosen block, or `None` if there are no
    /// candidates.
    ///
    /// ```
    /// use arena_alloc::SelectionPolicy;
    ///
    /// let candidates = [("a", 64), ("b", 32), ("c", 128), ("d", 32)];
    /// assert_eq!(SelectionPolicy::FirstFit.select(candidates), Some("a"));
    /// assert_eq!(SelectionPolicy::BestFit.select(candidates), Some("b"));
    /// assert_eq!(SelectionPolicy::WorstFit.select(candidates), Some("c"));
    /// ```
    pub fn select<K, I>(self, candidates: I) -> Option<K>
    where
        I: IntoIterator<Item = (K, usize)>,
    {
        let mut candidates = candidates.into_iter();
        let chosen = match self {
            Self::FirstFit => candidates.next(),
            // `reduce` keeps the earlier element unless the later one is strictly better.
            Self::BestFit => candidates.reduce(|best, c| if c.1 < best.1 { c } else { best }),
            Self::WorstFit => candidates.reduce(|best, c| if c.1 > best.1 { c } else { best }),
        };
        chosen.map(|(key, _size)| key)
    }
}

impl FromStr for SelectionPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first-fit" | "first" => Ok(Self::FirstFit),
            "best-fit" | "best" => Ok(Self::BestFit),
            "worst-fit" | "worst" => Ok(Self::WorstFit),
            _ => ParsePolicySnafu { input: s }.fail(),
        }
    }
}
