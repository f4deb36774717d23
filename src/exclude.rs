use std::{fs, net::Ipv4Addr, str::FromStr};

use eyre::{bail, eyre};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Range {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

impl Ipv4Range {
    pub fn single(addr: Ipv4Addr) -> Self {
        Self {
            start: addr,
            end: addr,
        }
    }

    pub fn cidr(addr: Ipv4Addr, prefix: u8) -> eyre::Result<Self> {
        if prefix > 32 {
            bail!("Invalid prefix length /{prefix}");
        }
        let host_bits = u32::MAX.checked_shr(prefix as u32).unwrap_or(0);
        let addr = u32::from(addr);
        Ok(Self {
            start: Ipv4Addr::from(addr & !host_bits),
            end: Ipv4Addr::from(addr | host_bits),
        })
    }
}

/// A sorted set of ranges that can be checked quickly.
#[derive(Debug, Clone, Default)]
pub struct Ipv4Ranges {
    ranges: Vec<Ipv4Range>,
}

impl Ipv4Ranges {
    pub fn new(mut ranges: Vec<Ipv4Range>) -> Self {
        ranges.sort_by_key(|r| r.start);

        // merge overlapping ranges so the binary search only has to look at
        // one of them
        let mut merged: Vec<Ipv4Range> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if u32::from(range.start) <= u32::from(last.end).saturating_add(1) => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }

        Self { ranges: merged }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        // index of the first range that starts after addr
        let after = self.ranges.partition_point(|r| r.start <= addr);
        after > 0 && self.ranges[after - 1].end >= addr
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }
}

pub fn parse_file(path: &str) -> eyre::Result<Ipv4Ranges> {
    let input = fs::read_to_string(path).map_err(|err| eyre!("Couldn't read {path}: {err}"))?;

    parse(&input)
}

/// One range per line, either `1.2.3.4`, `1.2.3.0/24` or `1.2.3.4-1.2.3.9`.
/// Everything after a `#` is ignored.
pub fn parse(input: &str) -> eyre::Result<Ipv4Ranges> {
    let mut ranges = Vec::new();

    for line in input.lines() {
        let line = match line.split_once('#') {
            Some((before, _)) => before,
            None => line,
        }
        .trim();

        if line.is_empty() {
            continue;
        }

        let range = match (line.split_once('/'), line.split_once('-')) {
            (Some(_), Some(_)) => {
                bail!("Invalid exclude range: {line} (cannot contain both - and /)");
            }
            (Some((ip, prefix)), None) => {
                let ip = Ipv4Addr::from_str(ip.trim())?;
                let prefix = prefix
                    .trim()
                    .parse::<u8>()
                    .map_err(|err| eyre!("Invalid exclude range: {line} ({err})"))?;
                Ipv4Range::cidr(ip, prefix)?
            }
            (None, Some((start, end))) => {
                let start = Ipv4Addr::from_str(start.trim())?;
                let end = Ipv4Addr::from_str(end.trim())?;
                if start > end {
                    bail!("Invalid exclude range: {line} (start cannot be greater than end)");
                }
                Ipv4Range { start, end }
            }
            (None, None) => Ipv4Range::single(
                Ipv4Addr::from_str(line).map_err(|err| eyre!("Invalid exclude range: {line} ({err})"))?,
            ),
        };

        ranges.push(range);
    }

    Ok(Ipv4Ranges::new(ranges))
}
