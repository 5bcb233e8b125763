// Copyright 2021 Karl Sundequist Blomdahl <karl.sundequist.blomdahl@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;
use std::fmt;

/// `(count, sum, sum of squares)` of an observed quantity.
pub type StatsValue = (f64, f64, f64);

/// A set of named running statistics. Values accumulate as
/// count/sum/sum-of-squares triples so that independently collected sets
/// can be merged without loss.
#[derive(Clone, Default)]
pub struct Stats {
    values: BTreeMap<String, StatsValue>
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation of the named quantity.
    ///
    /// # Arguments
    ///
    /// * `name` -
    /// * `value` -
    ///
    pub fn record(&mut self, name: &str, value: f64) {
        let entry = self.values.entry(name.into()).or_insert((0.0, 0.0, 0.0));

        entry.0 += 1.0;
        entry.1 += value;
        entry.2 += value * value;
    }

    /// Fold another set of statistics into this one.
    ///
    /// # Arguments
    ///
    /// * `other` -
    ///
    pub fn merge(&mut self, other: &Stats) {
        for (name, (n, sum, sumsq)) in &other.values {
            let entry = self.values.entry(name.clone()).or_insert((0.0, 0.0, 0.0));

            entry.0 += n;
            entry.1 += sum;
            entry.2 += sumsq;
        }
    }

    pub fn get(&self, name: &str) -> Option<StatsValue> {
        self.values.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        for (name, (n, sum, sumsq)) in &self.values {
            let mean = if *n > 0.0 { sum / n } else { 0.0 };
            let stddev = if *n > 0.0 { (sumsq / n - mean * mean).max(0.0).sqrt() } else { 0.0 };

            writeln!(fmt, "{}: N={}, avg={}, std={}", name, n, mean, stddev)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_merge() {
        let mut a = Stats::new();
        a.record("x", 1.0);
        a.record("x", 3.0);

        let mut b = Stats::new();
        b.record("x", 5.0);
        b.record("y", 1.0);

        a.merge(&b);

        assert_eq!(a.get("x"), Some((3.0, 9.0, 35.0)));
        assert_eq!(a.get("y"), Some((1.0, 1.0, 1.0)));
    }

    #[test]
    fn display_contains_mean() {
        let mut stats = Stats::new();
        stats.record("moves", 2.0);
        stats.record("moves", 4.0);

        let text = stats.to_string();

        assert!(text.contains("moves: N=2, avg=3"), "{}", text);
    }
}
