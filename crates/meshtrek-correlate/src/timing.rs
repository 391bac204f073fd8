//! Per-hop latency decomposition
//!
//! Every instant is a capture-local nanosecond counter. Differences are taken
//! in signed 64-bit arithmetic, so clock skew between probes shows up as a
//! negative component instead of wrapping. Results are reported in
//! milliseconds.

use crate::trace::{Hop, TraceMetadata};
use std::iter::Sum;
use std::ops::{Add, AddAssign};

pub const NS_PER_MS: f64 = 1_000_000.0;

pub fn ns_to_ms(ns: i64) -> f64 {
    ns as f64 / NS_PER_MS
}

fn span(end: u64, start: u64) -> i64 {
    end as i64 - start as i64
}

/// The four latency buckets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Wait,
    Parse,
    Filter,
    Overhead,
}

impl Metric {
    pub const ALL: [Metric; 4] = [Metric::Wait, Metric::Parse, Metric::Filter, Metric::Overhead];
}

/// Latency buckets in nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HopTimings {
    pub wait: i64,
    pub parse: i64,
    pub filter: i64,
    pub overhead: i64,
}

impl HopTimings {
    /// Decompose one hop. Overhead is the plain sum of the other buckets.
    pub fn of_hop(hop: &Hop) -> Self {
        let wait = wait_ns(hop);
        let parse = parse_ns(hop);
        let filter = filter_ns(hop);
        Self {
            wait,
            parse,
            filter,
            overhead: wait + parse + filter,
        }
    }

    pub fn set(&mut self, metric: Metric, value: i64) {
        match metric {
            Metric::Wait => self.wait = value,
            Metric::Parse => self.parse = value,
            Metric::Filter => self.filter = value,
            Metric::Overhead => self.overhead = value,
        }
    }

    /// Time attributed to every bucket except `metric`.
    ///
    /// Overhead already covers the other three, so nothing is excluded for it.
    pub fn excluding(&self, metric: Metric) -> i64 {
        match metric {
            Metric::Wait => self.parse + self.filter,
            Metric::Parse => self.wait + self.filter,
            Metric::Filter => self.wait + self.parse,
            Metric::Overhead => 0,
        }
    }
}

impl Add for HopTimings {
    type Output = HopTimings;

    fn add(self, rhs: HopTimings) -> HopTimings {
        HopTimings {
            wait: self.wait + rhs.wait,
            parse: self.parse + rhs.parse,
            filter: self.filter + rhs.filter,
            overhead: self.overhead + rhs.overhead,
        }
    }
}

impl AddAssign for HopTimings {
    fn add_assign(&mut self, rhs: HopTimings) {
        *self = *self + rhs;
    }
}

impl Sum for HopTimings {
    fn sum<I: Iterator<Item = HopTimings>>(iter: I) -> Self {
        iter.fold(HopTimings::default(), Add::add)
    }
}

fn wait_ns(hop: &Hop) -> i64 {
    let req = &hop.req.times;
    let resp = &hop.resp.stream.times;

    let mut wait = span(req.header_parse_start, hop.conn.parse_start)
        + span(hop.conn.parse_end, req.stream_end)
        + span(resp.header_parse_start, hop.upstream_conn.parse_start)
        + span(hop.upstream_conn.parse_end, resp.stream_end);
    if req.has_data_phase() {
        wait += span(req.data_parse_start, req.header_process_end);
    }
    if req.has_trailer_phase() {
        wait += span(req.trailer_parse_start, req.data_process_end);
    }
    wait
}

fn parse_ns(hop: &Hop) -> i64 {
    let req = &hop.req.times;
    let resp = &hop.resp.stream.times;

    let mut parse = span(req.header_filter_start, req.header_parse_start)
        + span(resp.header_filter_start, resp.header_parse_start);
    if req.has_data_phase() {
        parse += span(req.data_filter_start, req.data_parse_start);
    }
    if resp.has_data_phase() {
        parse += span(resp.data_filter_start, resp.data_parse_start);
    }
    if resp.has_trailer_phase() {
        parse += span(resp.trailer_filter_start, resp.trailer_parse_start);
    }
    parse
}

fn filter_ns(hop: &Hop) -> i64 {
    let req = &hop.req.times;
    let resp = &hop.resp.stream.times;

    let mut filter = span(req.header_process_end, req.header_filter_start)
        + span(resp.header_process_end, resp.header_filter_start);
    if req.has_data_phase() {
        filter += span(req.stream_end, req.data_filter_start);
    }
    if resp.has_data_phase() {
        filter += span(resp.data_process_end, resp.data_filter_start);
    }
    if resp.has_trailer_phase() {
        filter += span(resp.stream_end, resp.trailer_filter_start);
    }
    filter
}

/// Latest upstream parse end minus earliest downstream parse start (ns).
pub fn request_time_ns(hops: &[Hop]) -> i64 {
    let end = hops.iter().map(|h| h.upstream_conn.parse_end).max();
    let start = hops.iter().map(|h| h.conn.parse_start).min();
    match (end, start) {
        (Some(end), Some(start)) => span(end, start),
        _ => 0,
    }
}

impl TraceMetadata {
    /// Build metadata from aggregated buckets.
    pub fn from_timings(total_sub_requests: usize, request_time_ns: i64, timings: HopTimings) -> Self {
        Self {
            total_sub_requests,
            request_time: ns_to_ms(request_time_ns),
            wait: ns_to_ms(timings.wait),
            parse: ns_to_ms(timings.parse),
            filter: ns_to_ms(timings.filter),
            overhead: ns_to_ms(timings.overhead),
        }
    }

    /// Per-hop sums with no fan-out correction.
    pub fn naive(hops: &[Hop]) -> Self {
        let timings = hops.iter().map(HopTimings::of_hop).sum();
        Self::from_timings(hops.len(), request_time_ns(hops), timings)
    }
}
