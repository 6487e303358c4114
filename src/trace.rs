use crate::hyperlink::{Hyperlink, LinkMode, StopState};
use crate::path::{Path, PathInfo};
use crate::queue::LabelStop;
use crate::request::{Config, PathSpecification, PerformanceInfo};
use crate::supply::{StopId, Supply};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};

/// Per-request trace output: a request log with per-iteration hyperlink
/// snapshots, a labels CSV, a stop-label-iteration CSV, and an append-only
/// path-set file.
///
/// Every method is a no-op when the request's trace flag is off, so tracing
/// can never change what the algorithm returns.
pub struct TraceLog<'a> {
    supply: &'a Supply,
    log: Option<BufWriter<File>>,
    labels: Option<BufWriter<File>>,
    stopids: Option<BufWriter<File>>,
    pathset: Option<BufWriter<File>>,
    link_num: u32,
    outbound: bool,
}

impl<'a> TraceLog<'a> {
    /// A disabled trace; everything is dropped.
    pub fn off(supply: &'a Supply) -> TraceLog<'a> {
        TraceLog {
            supply,
            log: None,
            labels: None,
            stopids: None,
            pathset: None,
            link_num: 1,
            outbound: true,
        }
    }

    pub fn new(supply: &'a Supply, config: &Config, spec: &PathSpecification) -> TraceLog<'a> {
        if !spec.trace {
            return TraceLog::off(supply);
        }
        let open = |name: String, append: bool| -> Option<BufWriter<File>> {
            let path = config.output_dir.join(name);
            let result = OpenOptions::new()
                .create(true)
                .write(true)
                .append(append)
                .truncate(!append)
                .open(&path);
            match result {
                Ok(file) => Some(BufWriter::new(file)),
                Err(err) => {
                    log::warn!("could not open trace file {}: {err}", path.display());
                    None
                }
            }
        };
        // a request is re-traced across iterations; append after the first
        let append = spec.iteration > 1;
        let mut trace = TraceLog {
            supply,
            log: open(format!("hyperpath_trace_{}.log", spec.path_id), append),
            labels: open(format!("hyperpath_labels_{}.csv", spec.path_id), append),
            stopids: open(format!("hyperpath_labels_ids_{}.csv", spec.path_id), append),
            pathset: open("hyperpath_pathset.txt".to_owned(), true),
            link_num: 1,
            outbound: spec.outbound,
        };
        if !append {
            if let Some(w) = trace.labels.as_mut() {
                let _ = writeln!(w, "label_iteration,link,node ID,time,mode,trip_id,link_time,link_cost,cost,AB");
            }
            if let Some(w) = trace.stopids.as_mut() {
                let _ = writeln!(w, "stop_id,stop_id_label_iter");
            }
        }
        trace
    }

    pub fn enabled(&self) -> bool {
        self.log.is_some()
    }

    pub fn writeln(&mut self, line: &str) {
        if let Some(w) = self.log.as_mut() {
            let _ = writeln!(w, "{line}");
        }
    }

    pub fn request_echo(&mut self, spec: &PathSpecification) {
        if !self.enabled() {
            return;
        }
        let origin = self.supply.stop_str(spec.origin_taz_id);
        let destination = self.supply.stop_str(spec.destination_taz_id);
        self.writeln(&format!(
            "Tracing assignment of person {} trip {} with path id {}",
            spec.person_id, spec.person_trip_id, spec.path_id
        ));
        self.writeln(&format!("iteration       = {}", spec.iteration));
        self.writeln(&format!("outbound        = {}", spec.outbound));
        self.writeln(&format!("hyperpath       = {}", spec.hyperpath));
        self.writeln(&format!(
            "preferred_time  = {} ({})",
            fmt_time(spec.preferred_time),
            spec.preferred_time
        ));
        self.writeln(&format!("user_class      = {}", spec.user_class));
        self.writeln(&format!("purpose         = {}", spec.purpose));
        self.writeln(&format!("access_mode     = {}", spec.access_mode));
        self.writeln(&format!("transit_mode    = {}", spec.transit_mode));
        self.writeln(&format!("egress_mode     = {}", spec.egress_mode));
        self.writeln(&format!("orig_taz_id     = {origin}"));
        self.writeln(&format!("dest_taz_id     = {destination}"));
    }

    fn mode_str(&self, ss: &StopState) -> String {
        match ss.mode {
            LinkMode::Access => "Access".to_owned(),
            LinkMode::Egress => "Egress".to_owned(),
            LinkMode::Transfer => "Transfer".to_owned(),
            LinkMode::Transit => self
                .supply
                .trip_info(ss.trip_id)
                .map(|ti| self.supply.mode_str(ti.supply_mode))
                .unwrap_or_else(|| "???".to_owned()),
        }
    }

    fn trip_str(&self, ss: &StopState) -> String {
        if ss.mode.is_trip() {
            self.supply.trip_str(ss.trip_id)
        } else {
            self.supply.mode_str(ss.trip_id)
        }
    }

    pub fn fmt_state(&self, stop_id: StopId, ss: &StopState) -> String {
        format!(
            "{:>8}: {} {:>10} {:>12} {:>10} {:>3} {:>3} {:>8.2} {:>8.2} {:>10.4} {:>10.4} {:>5} {} {:>6.4} {:>8}",
            self.supply.stop_str(stop_id),
            fmt_time(ss.deparr_time),
            self.mode_str(ss),
            self.trip_str(ss),
            self.supply.stop_str(ss.stop_succpred),
            ss.seq,
            ss.seq_succpred,
            ss.link_time,
            ss.link_fare,
            ss.link_cost,
            ss.cost,
            ss.iteration,
            fmt_time(ss.arrdep_time),
            ss.probability,
            ss.cum_prob_i.map_or(-1i64, |c| c as i64),
        )
    }

    /// A link was offered to a hyperlink ("+ new ... (rejected|window|...)").
    pub fn link_event(&mut self, stop_id: StopId, ss: &StopState, note: &str) {
        if !self.enabled() {
            return;
        }
        let line = format!("  + new {}{note}", self.fmt_state(stop_id, ss));
        self.writeln(&line);
    }

    /// Two rows (A side, B side) in the labels CSV for an accepted link.
    pub fn label_link(&mut self, stop_id: StopId, ss: &StopState) {
        if self.labels.is_none() {
            return;
        }
        let mode = self.mode_str(ss);
        let trip = self.trip_str(ss);
        let rows = [
            (self.supply.stop_str(stop_id), ss.deparr_time, 0),
            (self.supply.stop_str(ss.stop_succpred), ss.arrdep_time, 1),
        ];
        for (node, time, o_d) in rows {
            let ab = if (self.outbound && o_d == 0) || (!self.outbound && o_d == 1) { "A" } else { "B" };
            if let Some(w) = self.labels.as_mut() {
                let _ = writeln!(
                    w,
                    "{},{},{},{},{},{},{},{},{:.4},{}",
                    ss.iteration, self.link_num, node, time, mode, trip, ss.link_time, ss.link_cost, ss.cost, ab
                );
            }
        }
        self.link_num += 1;
    }

    pub fn stop_label(&mut self, stop_id: StopId, label_iteration: u32) {
        let name = self.supply.stop_str(stop_id);
        if let Some(w) = self.stopids.as_mut() {
            let _ = writeln!(w, "{name},{label_iteration}");
        }
    }

    /// Snapshot of a hyperlink as it is pulled off the queue.
    pub fn pop_snapshot(&mut self, current: &LabelStop, label_iteration: u32, hyperlink: &Hyperlink) {
        if !self.enabled() {
            return;
        }
        self.writeln(&format!(
            "Pulling from label_stop_queue (iteration {:>6}, stop {}, is_trip {}, label {:.6}) :======",
            label_iteration,
            self.supply.stop_str(current.stop_id),
            current.is_trip,
            current.label
        ));
        for of_trip_links in [true, false] {
            let side = if of_trip_links { "Trip links" } else { "Non-trip links" };
            if hyperlink.size(of_trip_links) == 0 {
                self.writeln(&format!("   No {}", side.to_lowercase()));
                continue;
            }
            self.writeln(&format!(
                " {side} (size {}; count {}; lder {} ; cost {:.4})",
                hyperlink.size(of_trip_links),
                hyperlink.process_count(of_trip_links),
                fmt_time(hyperlink.latest_departure_earliest_arrival(of_trip_links)),
                hyperlink.hyperpath_cost(of_trip_links),
            ));
            let lines: Vec<String> = hyperlink
                .states_by_cost(of_trip_links)
                .map(|ss| format!("  {}", self.fmt_state(hyperlink.stop_id(), ss)))
                .collect();
            for line in lines {
                self.writeln(&line);
            }
        }
        self.writeln("==============================");
    }

    /// One line per surviving path in the append-only path-set file.
    pub fn pathset_entry(&mut self, spec: &PathSpecification, path: &Path, info: &PathInfo) {
        if self.pathset.is_none() {
            return;
        }
        let (board_stops, trips, alight_stops) = path.summary_fields(self.supply);
        if let Some(w) = self.pathset.as_mut() {
            let _ = writeln!(
                w,
                "{} {} {} {:8.2} {:8.6} {} {} {}",
                spec.iteration,
                spec.person_id,
                spec.path_id,
                info.cost,
                info.probability,
                board_stops,
                trips,
                alight_stops
            );
        }
    }

    pub fn path_snapshot(&mut self, header: &str, path: &Path) {
        if !self.enabled() {
            return;
        }
        self.writeln(header);
        let lines: Vec<String> =
            path.links().iter().map(|(stop_id, ss)| self.fmt_state(*stop_id, ss)).collect();
        for line in lines {
            self.writeln(&line);
        }
    }

    pub fn performance(&mut self, perf: &PerformanceInfo) {
        if !self.enabled() {
            return;
        }
        self.writeln(&format!("        label iterations: {}", perf.label_iterations));
        self.writeln(&format!("       max process count: {}", perf.max_process_count));
        self.writeln(&format!("   milliseconds labeling: {}", perf.milliseconds_labeling));
        self.writeln(&format!("milliseconds enumerating: {}", perf.milliseconds_enumerating));
    }
}

/// "HH:MM:SS" for a time in minutes after midnight (may be negative or past
/// the day boundary; shown as-is).
pub fn fmt_time(time_min: f64) -> String {
    let negative = time_min < 0.0;
    let total_seconds = (time_min.abs() * 60.0).round() as i64;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{}{:02}:{:02}:{:02}", if negative { "-" } else { "" }, hours, minutes, seconds)
}
