//! Snapshot selection and retrieval ordering.
//!
//! [`select_snapshots`] decides which of the archive's captures are worth
//! fetching for one URL; [`ruler_order`] decides in what order to fetch them
//! so that early fetches carry the most information about where along the
//! timeline the content changed.

use chrono::{DateTime, Duration, Utc};

/// Minimum spacing between selected snapshots inside the window.
pub fn thirty_days() -> Duration {
    Duration::days(30)
}

/// One mean Gregorian year, used to pad the low end of the date window.
pub fn one_year() -> Duration {
    Duration::seconds((365.2425 * 86400.0) as i64)
}

/// Choose a covering subset of the available snapshot timestamps.
///
/// `avail` need not be sorted; `lo` and `hi` are swapped if inverted. The
/// returned subset consists of:
///
/// - the most recent timestamp strictly older than `lo`, or the oldest
///   available timestamp when none predates `lo`;
/// - timestamps in `[lo, hi)` each at least thirty days after the previously
///   selected one;
/// - the most recent timestamp older than `hi`, even when the thirty-day
///   rule would exclude it;
/// - when the archive has nothing at or after `hi`, the newest timestamp it
///   does have.
pub fn select_snapshots(
    avail: &[DateTime<Utc>],
    lo: DateTime<Utc>,
    hi: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    if avail.is_empty() {
        return Vec::new();
    }

    let mut avail: Vec<DateTime<Utc>> = avail.to_vec();
    avail.sort();
    let (lo, hi) = if lo > hi { (hi, lo) } else { (lo, hi) };

    let mut rv = Vec::new();

    // Index of the first element > lo, backed up one so the selection starts
    // just before the window opens.
    let mut start = avail.partition_point(|&t| t <= lo);
    if start > 0 {
        start -= 1;
    }
    rv.push(avail[start]);

    for i in (start + 1)..avail.len() {
        if avail[i] >= hi {
            // Always take the most recent timestamp older than hi, even if
            // that violates the thirty-day rule.
            if *rv.last().unwrap() < avail[i - 1] {
                rv.push(avail[i - 1]);
            }
            return rv;
        }

        if avail[i] - *rv.last().unwrap() >= thirty_days() {
            rv.push(avail[i]);
        }
    }

    // The archive has nothing newer than hi; take the last thing it has.
    if *rv.last().unwrap() < *avail.last().unwrap() {
        rv.push(*avail.last().unwrap());
    }
    rv
}

/// Permute `lst` into "ruler order", reversed for popping.
///
/// Ruler order is the order a binary search would visit the elements: think
/// of the heights of the tick marks on a ruler. The output is reversed so
/// that repeatedly popping from the *end* yields the midpoint first, then
/// the midpoints of the halves, and so on.
pub fn ruler_order<T: Clone>(lst: &[T]) -> Vec<T> {
    if lst.is_empty() {
        return Vec::new();
    }
    let k = lst.len() / 2;
    let mut out = ruler_order(&lst[k + 1..]);
    out.extend(ruler_order(&lst[..k]));
    out.push(lst[k].clone());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn d(y: i32, m: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn empty_availability() {
        assert!(select_snapshots(&[], d(2012, 1, 1), d(2014, 1, 1)).is_empty());
    }

    #[test]
    fn takes_anchor_before_window() {
        let avail = vec![d(2010, 1, 1), d(2012, 6, 1), d(2013, 1, 1)];
        let sel = select_snapshots(&avail, d(2011, 1, 1), d(2014, 1, 1));
        assert_eq!(sel[0], d(2010, 1, 1));
    }

    #[test]
    fn takes_oldest_when_nothing_predates_lo() {
        let avail = vec![d(2012, 6, 1), d(2013, 1, 1)];
        let sel = select_snapshots(&avail, d(2011, 1, 1), d(2014, 1, 1));
        assert_eq!(sel[0], d(2012, 6, 1));
    }

    #[test]
    fn swapped_window_is_fixed() {
        let avail = vec![d(2012, 6, 1), d(2013, 1, 1)];
        let a = select_snapshots(&avail, d(2011, 1, 1), d(2014, 1, 1));
        let b = select_snapshots(&avail, d(2014, 1, 1), d(2011, 1, 1));
        assert_eq!(a, b);
    }

    #[test]
    fn thirty_day_rule_inside_window() {
        let avail = vec![
            d(2012, 1, 1),
            d(2012, 1, 10), // < 30 days after previous pick, dropped
            d(2012, 2, 15),
            d(2012, 2, 20), // dropped
            d(2012, 4, 1),
        ];
        let sel = select_snapshots(&avail, d(2011, 12, 1), d(2013, 1, 1));
        assert_eq!(
            sel,
            vec![d(2012, 1, 1), d(2012, 2, 15), d(2012, 4, 1)]
        );
    }

    #[test]
    fn always_takes_newest_before_hi() {
        // 2012-03-05 is only 4 days after the previous pick but is the last
        // snapshot before hi, so it must be included anyway.
        let avail = vec![d(2012, 1, 1), d(2012, 3, 1), d(2012, 3, 5), d(2014, 1, 1)];
        let sel = select_snapshots(&avail, d(2011, 12, 1), d(2012, 6, 1));
        assert_eq!(sel, vec![d(2012, 1, 1), d(2012, 3, 1), d(2012, 3, 5)]);
    }

    #[test]
    fn takes_newest_available_when_archive_ends_before_hi() {
        let avail = vec![d(2012, 1, 1), d(2012, 3, 1), d(2012, 3, 5)];
        let sel = select_snapshots(&avail, d(2011, 12, 1), d(2013, 1, 1));
        assert_eq!(*sel.last().unwrap(), d(2012, 3, 5));
    }

    #[test]
    fn scenario_full_availability() {
        // lodate 2012-06-01 minus one year ≈ 2011-06-01, hidate 2014-06-01.
        // The 2010 snapshot is the pre-window anchor: the most recent state
        // older than the window's low edge.
        let avail = vec![
            d(2010, 1, 1),
            d(2011, 6, 15),
            d(2012, 1, 1),
            d(2013, 7, 1),
            d(2014, 3, 15),
        ];
        let lo = d(2012, 6, 1) - one_year();
        let sel = select_snapshots(&avail, lo, d(2014, 6, 1));
        assert_eq!(
            sel,
            vec![
                d(2010, 1, 1),
                d(2011, 6, 15),
                d(2012, 1, 1),
                d(2013, 7, 1),
                d(2014, 3, 15)
            ]
        );
    }

    #[test]
    fn output_is_subsequence_with_spaced_gaps() {
        let avail: Vec<_> = (0..200).map(|i| d(2010, 1, 1) + Duration::days(i * 7)).collect();
        let sel = select_snapshots(&avail, d(2010, 6, 1), d(2012, 6, 1));

        let mut sorted = avail.clone();
        sorted.sort();
        let mut it = sorted.iter();
        for s in &sel {
            assert!(it.any(|t| t == s), "selection is not a subsequence");
        }
        // Every gap except those adjacent to the hi boundary is >= 30 days.
        for w in sel.windows(2).take(sel.len().saturating_sub(2)) {
            assert!(w[1] - w[0] >= thirty_days() || w[0] < d(2010, 6, 1));
        }
    }

    #[test]
    fn ruler_order_is_permutation() {
        for n in 0..40usize {
            let lst: Vec<usize> = (0..n).collect();
            let mut out = ruler_order(&lst);
            out.sort();
            assert_eq!(out, lst, "not a permutation for n={n}");
        }
    }

    #[test]
    fn ruler_order_pops_midpoints_first() {
        let lst: Vec<u32> = (0..7).collect();
        let out = ruler_order(&lst);
        // Popping from the end walks the implicit search tree: the root,
        // then depth-first through the left half, then the right half.
        assert_eq!(out, vec![6, 4, 5, 2, 0, 1, 3]);
    }
}
