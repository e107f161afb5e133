// Copyright 2025 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Human-readable table statistics for the debug/admin surface.

use core::fmt::Write;

use crate::{Dict, KeyDiscipline};

const STATS_VECTLEN: usize = 50;

impl<V, D: KeyDiscipline> Dict<V, D> {
    /// Renders chain-length statistics for the main table and, while a
    /// migration is in flight, the target table.
    pub fn stats(&self) -> String {
        let mut out = String::new();
        self.table_stats(&mut out, 0);
        if self.is_rehashing() {
            self.table_stats(&mut out, 1);
        }
        out
    }

    fn table_stats(&self, out: &mut String, t: usize) {
        let ht = &self.ht[t];
        let which = if t == 0 {
            "main hash table"
        } else {
            "rehashing target"
        };

        if ht.used == 0 {
            let _ = writeln!(out, "Hash table {} stats ({}): empty", t, which);
            return;
        }

        let mut slots = 0usize;
        let mut maxchainlen = 0usize;
        let mut totchainlen = 0usize;
        let mut clvector = [0usize; STATS_VECTLEN];

        for idx in 0..ht.size() {
            let chainlen = self.chain_len(t, idx);
            if chainlen == 0 {
                clvector[0] += 1;
                continue;
            }
            slots += 1;
            clvector[chainlen.min(STATS_VECTLEN - 1)] += 1;
            maxchainlen = maxchainlen.max(chainlen);
            totchainlen += chainlen;
        }

        let _ = writeln!(
            out,
            "Hash table {} stats ({}):\n table size: {}\n number of elements: {}\n different slots: {}\n max chain length: {}\n avg chain length (counted): {:.2}\n avg chain length (computed): {:.2}\n Chain length distribution:",
            t,
            which,
            ht.size(),
            ht.used,
            slots,
            maxchainlen,
            totchainlen as f64 / slots as f64,
            ht.used as f64 / slots as f64,
        );
        for (len, count) in clvector.iter().enumerate() {
            if *count == 0 {
                continue;
            }
            let _ = writeln!(
                out,
                "   {}{}: {} ({:.2}%)",
                if len == STATS_VECTLEN - 1 { ">= " } else { "" },
                len,
                count,
                (*count as f64 / ht.size() as f64) * 100.0
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::Dict;

    #[test]
    fn stats_render_for_empty_and_filled_tables() {
        let mut d: Dict<u64> = Dict::new();
        assert!(d.stats().contains("empty"));

        for i in 0..100 {
            d.add(i.to_string().as_bytes(), 0).unwrap();
        }
        let report = d.stats();
        assert!(report.contains("number of elements: "));
        assert!(report.contains("Chain length distribution:"));
    }
}
