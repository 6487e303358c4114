use crate::hyperlink::{LinkMode, StopState};
use crate::pathfinder::tally_link_cost;
use crate::request::{Config, PathSpecification};
use crate::supply::{Attributes, FarePeriod, FareTransferType, StopId, Supply, WeightKey};
use crate::trace::TraceLog;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Wrap a time into [0, 1440) minutes.
pub fn fix_time_range(time: f64) -> f64 {
    let mut fixed = time;
    while fixed < 0.0 {
        fixed += 1440.0;
    }
    while fixed >= 1440.0 {
        fixed -= 1440.0;
    }
    fixed
}

/// What the stochastic algorithm collects about each unique path.
#[derive(Debug, Clone, Default)]
pub struct PathInfo {
    /// Number of random walks that produced this path.
    pub count: u32,
    pub cost: f64,
    pub capacity_problem: bool,
    pub probability: f64,
    /// Cumulative integerized probability for the final draw.
    pub prob_i: u64,
}

// aliases into the direction-dependent time fields: outbound stop states
// hold (departure, arrival) in (deparr, arrdep), inbound the reverse
fn dep(outbound: bool, ss: &StopState) -> f64 {
    if outbound { ss.deparr_time } else { ss.arrdep_time }
}

fn arr(outbound: bool, ss: &StopState) -> f64 {
    if outbound { ss.arrdep_time } else { ss.deparr_time }
}

fn set_dep(outbound: bool, ss: &mut StopState, time: f64) {
    if outbound {
        ss.deparr_time = time;
    } else {
        ss.arrdep_time = time;
    }
}

fn set_arr(outbound: bool, ss: &mut StopState, time: f64) {
    if outbound {
        ss.arrdep_time = time;
    } else {
        ss.deparr_time = time;
    }
}

/// Fare for a board in the given fare period, adjusted by the fare-transfer
/// rule from the previous fare period when one matches.
fn fare_with_transfer(supply: &Supply, last_fare_period: Option<&str>, fp: &FarePeriod) -> f64 {
    let mut fare = fp.price;
    let Some(last) = last_fare_period else {
        return fare;
    };
    let Some(rule) = supply.fare_transfer(last, &fp.fare_period) else {
        return fare;
    };
    match rule.transfer_type {
        FareTransferType::Free => fare = 0.0,
        FareTransferType::Discount => fare -= rule.amount,
        FareTransferType::SetCost => fare = rule.amount,
    }
    fare.max(0.0)
}

/// A concrete path: an ordered list of (stop id, stop state) links with
/// accumulated cost and fare.
///
/// Links run origin to destination for outbound trips and destination to
/// origin for inbound trips.
#[derive(Debug, Clone)]
pub struct Path {
    outbound: bool,
    enumerating: bool,
    links: Vec<(StopId, StopState)>,
    cost: f64,
    fare: f64,
    initial_cost: f64,
    initial_fare: f64,
    capacity_problem: bool,
    boards_per_fare_period: BTreeMap<String, u32>,
}

impl Path {
    pub fn new(outbound: bool, enumerating: bool) -> Path {
        Path {
            outbound,
            enumerating,
            links: Vec::new(),
            cost: 0.0,
            fare: 0.0,
            initial_cost: 0.0,
            initial_fare: 0.0,
            capacity_problem: false,
            boards_per_fare_period: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn links(&self) -> &[(StopId, StopState)] {
        &self.links
    }

    pub fn back(&self) -> Option<&(StopId, StopState)> {
        self.links.last()
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn fare(&self) -> f64 {
        self.fare
    }

    /// Cost and fare as accumulated during labeling, before the
    /// recomputation pass.
    pub fn initial_cost(&self) -> f64 {
        self.initial_cost
    }

    pub fn initial_fare(&self) -> f64 {
        self.initial_fare
    }

    pub fn capacity_problem(&self) -> bool {
        self.capacity_problem
    }

    /// The most recently appended transit link.
    pub fn last_added_trip(&self) -> Option<&(StopId, StopState)> {
        self.links.iter().rev().find(|(_, ss)| ss.mode.is_trip())
    }

    pub fn boards_for_fare_period(&self, fare_period: &str) -> u32 {
        self.boards_per_fare_period.get(fare_period).copied().unwrap_or(0)
    }

    /// True when the link vector is in chronological order.
    fn chrono_order(&self) -> bool {
        (!self.outbound && !self.enumerating) || (self.outbound && self.enumerating)
    }

    /// Append a link, rewriting times as the path becomes concrete.
    ///
    /// Hyperpaths carry some built-in uncertainty which gets rectified here:
    /// access links snap to the scheduled departure of the boarded vehicle,
    /// transfers move to leave no slack, and waits land on the trip that
    /// incurs them. Returns false if any time-ordering invariant broke; the
    /// path is still updated so callers may inspect it, but an infeasible
    /// path must not be emitted.
    pub fn add_link(
        &mut self,
        stop_id: StopId,
        link: &StopState,
        supply: &Supply,
        spec: &PathSpecification,
        trace: &mut TraceLog,
    ) -> bool {
        let mut new_link = link.clone();
        new_link.probability = 0.0;
        new_link.cum_prob_i = None;
        let mut feasible = true;
        let ob = self.outbound;

        if let Some(prev_idx) = self.links.len().checked_sub(1) {
            if self.chrono_order() {
                let prev_mode = self.links[prev_idx].1.mode;
                if prev_mode == LinkMode::Access {
                    // Leave the origin as late as possible: the access link
                    // stretches to meet the boarded vehicle exactly.
                    let first_stop_id = if ob { stop_id } else { new_link.stop_succpred };
                    let first_stop_seq = if ob { new_link.seq } else { new_link.seq_succpred };
                    match supply.scheduled_departure(new_link.trip_id, first_stop_id, first_stop_seq)
                    {
                        Some(dep_time) => {
                            let prev = &mut self.links[prev_idx].1;
                            set_arr(ob, prev, dep_time);
                            let walk = prev.link_time;
                            set_dep(ob, prev, dep_time - walk);
                            // no wait left on the trip
                            new_link.link_time = arr(ob, &new_link) - dep(ob, &new_link);
                        }
                        None => {
                            log::warn!(
                                "no scheduled departure for trip {} at stop {first_stop_id}",
                                new_link.trip_id
                            );
                            feasible = false;
                        }
                    }
                } else if new_link.mode.is_trip() {
                    let prev_arr = arr(ob, &self.links[prev_idx].1);
                    new_link.link_time = arr(ob, &new_link) - prev_arr;
                    if new_link.link_time < 0.0 {
                        feasible = false;
                    }
                    if dep(ob, &new_link) < prev_arr {
                        feasible = false;
                    }
                } else if new_link.mode == LinkMode::Transfer {
                    // start transferring immediately
                    let prev_arr = arr(ob, &self.links[prev_idx].1);
                    let link_time = new_link.link_time;
                    set_dep(ob, &mut new_link, prev_arr);
                    set_arr(ob, &mut new_link, prev_arr + link_time);
                } else if new_link.mode == LinkMode::Egress {
                    // don't wait, just walk
                    let prev_arr = arr(ob, &self.links[prev_idx].1);
                    let link_time = new_link.link_time;
                    set_dep(ob, &mut new_link, prev_arr);
                    set_arr(ob, &mut new_link, prev_arr + link_time);
                }
            } else {
                // reverse chronological: egress, trip, [transfer, trip]*, access
                if new_link.mode == LinkMode::Access {
                    let prev = self.links[prev_idx].1.clone();
                    let first_stop_id = if ob { new_link.stop_succpred } else { prev.stop_succpred };
                    let first_stop_seq = if ob { prev.seq } else { prev.seq_succpred };
                    match supply.scheduled_departure(prev.trip_id, first_stop_id, first_stop_seq) {
                        Some(dep_time) => {
                            let link_time = new_link.link_time;
                            set_arr(ob, &mut new_link, dep_time);
                            set_dep(ob, &mut new_link, dep_time - link_time);
                            let boarded = &mut self.links[prev_idx].1;
                            let ivt = arr(ob, boarded) - dep(ob, boarded);
                            boarded.link_time = ivt;
                        }
                        None => {
                            log::warn!(
                                "no scheduled departure for trip {} at stop {first_stop_id}",
                                prev.trip_id
                            );
                            feasible = false;
                        }
                    }
                } else if new_link.mode.is_trip() {
                    // choosing in reverse, so pretend the wait is zero for now
                    new_link.link_time = arr(ob, &new_link) - dep(ob, &new_link);
                    // if the next-in-time link is a transfer, the wait is
                    // known: transfer right after arriving, and the wait
                    // moves onto the trip after the transfer
                    if self.links[prev_idx].1.mode == LinkMode::Transfer {
                        let new_arr = arr(ob, &new_link);
                        let transfer_arr;
                        {
                            let transfer = &mut self.links[prev_idx].1;
                            let walk = transfer.link_time;
                            set_dep(ob, transfer, new_arr);
                            set_arr(ob, transfer, new_arr + walk);
                            transfer_arr = new_arr + walk;
                        }
                        if prev_idx >= 1 {
                            let next_trip_dep = dep(ob, &self.links[prev_idx - 1].1);
                            if next_trip_dep < transfer_arr {
                                feasible = false;
                            }
                            let next_trip_arr = arr(ob, &self.links[prev_idx - 1].1);
                            let next_trip = &mut self.links[prev_idx - 1].1;
                            next_trip.link_time = next_trip_arr - transfer_arr;
                            if next_trip.link_time < 0.0 {
                                // negative wait
                                feasible = false;
                            }
                        }
                    }
                } else if new_link.mode == LinkMode::Transfer {
                    // transfer as late as possible to keep earlier trips open
                    let prev_dep = dep(ob, &self.links[prev_idx].1);
                    let link_time = new_link.link_time;
                    set_arr(ob, &mut new_link, prev_dep);
                    set_dep(ob, &mut new_link, prev_dep - link_time);
                }
                // an egress already in the path departs the moment we arrive
                if self.links[prev_idx].1.mode == LinkMode::Egress {
                    let new_arr = arr(ob, &new_link);
                    let egress = &mut self.links[prev_idx].1;
                    let walk = egress.link_time;
                    set_dep(ob, egress, new_arr);
                    set_arr(ob, egress, new_arr + walk);
                }
            }
        }

        self.cost += new_link.link_cost;
        self.fare += new_link.link_fare;
        new_link.cost = self.cost;
        if let Some(fp_idx) = new_link.fare_period {
            let name = supply.fare_period(fp_idx).fare_period.clone();
            *self.boards_per_fare_period.entry(name).or_insert(0) += 1;
        }
        if trace.enabled() {
            let line = format!("path_add {}", trace.fmt_state(stop_id, &new_link));
            trace.writeln(&line);
        }
        self.links.push((stop_id, new_link));
        feasible
    }

    /// Re-derive fares and costs from scratch now that all links are known.
    /// This may differ from the labeling-time costs; each link's cumulative
    /// cost is updated along the way.
    pub fn calculate_cost(
        &mut self,
        supply: &Supply,
        spec: &PathSpecification,
        config: &Config,
        trace: &mut TraceLog,
    ) {
        if self.links.is_empty() {
            return;
        }
        self.initial_cost = self.cost;
        self.initial_fare = self.fare;
        let dir_factor = spec.dir_factor();
        let chrono = self.chrono_order();
        let count = self.links.len();

        self.cost = 0.0;
        self.fare = 0.0;
        self.capacity_problem = false;
        let mut last_fare_period: Option<String> = None;
        // fare period -> (first board time, board count) for free transfers
        let mut fp_boards: BTreeMap<String, (f64, u32)> = BTreeMap::new();

        for step in 0..count {
            let index = if chrono { step } else { count - 1 - step };
            let stop_id = self.links[index].0;
            let state = self.links[index].1.clone();
            let orig_stop = if spec.outbound { stop_id } else { state.stop_succpred };
            let dest_stop = if spec.outbound { state.stop_succpred } else { stop_id };

            let mut link_fare = state.link_fare;
            let link_cost = match state.mode {
                LinkMode::Access => {
                    // inbound: the preferred time is the origin departure
                    let orig_departure_time = if spec.outbound {
                        state.deparr_time
                    } else {
                        state.deparr_time - state.link_time
                    };
                    let transit_stop = if spec.outbound { state.stop_succpred } else { stop_id };
                    let mut attributes = supply
                        .access_egress()
                        .attributes(spec.origin_taz_id, state.trip_id, transit_stop, orig_departure_time)
                        .cloned()
                        .unwrap_or_else(|| {
                            log::warn!(
                                "no access link attributes for taz {} stop {transit_stop}",
                                spec.origin_taz_id
                            );
                            Attributes::new()
                        });
                    for name in ["arrive_early_min", "arrive_late_min", "depart_early_min", "depart_late_min"] {
                        attributes.insert(name.to_owned(), 0.0);
                    }
                    if !spec.outbound {
                        if orig_departure_time < spec.preferred_time {
                            let early = spec.preferred_time - orig_departure_time;
                            attributes.insert(
                                "depart_early_min".to_owned(),
                                (early - config.depart_early_allowed_min).max(0.0),
                            );
                        } else {
                            attributes.insert(
                                "depart_late_min".to_owned(),
                                orig_departure_time - spec.preferred_time,
                            );
                        }
                    }
                    self.weighted_cost(
                        supply,
                        spec,
                        LinkMode::Access,
                        &spec.access_mode,
                        state.trip_id,
                        &attributes,
                        trace,
                    )
                }
                LinkMode::Egress => {
                    // outbound: the preferred time is the destination arrival
                    let dest_arrival_time = if spec.outbound {
                        state.deparr_time + state.link_time
                    } else {
                        state.deparr_time
                    };
                    let transit_stop = if spec.outbound { stop_id } else { state.stop_succpred };
                    let mut attributes = supply
                        .access_egress()
                        .attributes(
                            spec.destination_taz_id,
                            state.trip_id,
                            transit_stop,
                            dest_arrival_time,
                        )
                        .cloned()
                        .unwrap_or_else(|| {
                            log::warn!(
                                "no egress link attributes for taz {} stop {transit_stop}",
                                spec.destination_taz_id
                            );
                            Attributes::new()
                        });
                    for name in ["arrive_early_min", "arrive_late_min", "depart_early_min", "depart_late_min"] {
                        attributes.insert(name.to_owned(), 0.0);
                    }
                    if spec.outbound {
                        if dest_arrival_time > spec.preferred_time {
                            let late = dest_arrival_time - spec.preferred_time;
                            attributes.insert(
                                "arrive_late_min".to_owned(),
                                (late - config.arrive_late_allowed_min).max(0.0),
                            );
                        } else {
                            attributes.insert(
                                "arrive_early_min".to_owned(),
                                spec.preferred_time - dest_arrival_time,
                            );
                        }
                    }
                    self.weighted_cost(
                        supply,
                        spec,
                        LinkMode::Egress,
                        &spec.egress_mode,
                        state.trip_id,
                        &attributes,
                        trace,
                    )
                }
                LinkMode::Transfer => {
                    let attributes = if orig_stop == dest_stop {
                        config.zero_walk_transfer_attributes.clone()
                    } else {
                        supply.transfer_attributes(orig_stop, dest_stop).cloned().unwrap_or_else(
                            || {
                                log::warn!("no transfer attributes for {orig_stop} -> {dest_stop}");
                                Attributes::new()
                            },
                        )
                    };
                    self.weighted_cost(
                        supply,
                        spec,
                        LinkMode::Transfer,
                        "transfer",
                        supply.transfer_supply_mode(),
                        &attributes,
                        trace,
                    )
                }
                LinkMode::Transit => {
                    let trip_ivt_min = (state.arrdep_time - state.deparr_time) * dir_factor;
                    let trip_depart_time =
                        if spec.outbound { state.deparr_time } else { state.arrdep_time };
                    let wait_min = state.link_time - trip_ivt_min;

                    let overcap = match supply.trip_stop_time(state.trip_id, state.seq) {
                        Some(stt) => stt.overcap,
                        None => {
                            log::warn!(
                                "no stop time for trip {} seq {}",
                                state.trip_id,
                                state.seq
                            );
                            -1.0
                        }
                    };
                    if overcap > 0.0 {
                        self.capacity_problem = true;
                    }

                    let (supply_mode, mut link_attr) = match supply.trip_info(state.trip_id) {
                        Some(info) => (info.supply_mode, info.attributes.clone()),
                        None => {
                            log::warn!("no trip info for trip {}", state.trip_id);
                            (0, Attributes::new())
                        }
                    };
                    link_attr.insert("in_vehicle_time_min".to_owned(), trip_ivt_min);
                    link_attr.insert("wait_time_min".to_owned(), wait_min);
                    link_attr.insert("at_capacity".to_owned(), if overcap >= 0.0 { 1.0 } else { 0.0 });
                    link_attr.insert("overcap".to_owned(), overcap.max(0.0));

                    match state.fare_period {
                        Some(fp_idx) => {
                            let fp = supply.fare_period(fp_idx);
                            link_fare =
                                fare_with_transfer(supply, last_fare_period.as_deref(), fp);
                            match fp_boards.get_mut(&fp.fare_period) {
                                None => {
                                    fp_boards
                                        .insert(fp.fare_period.clone(), (trip_depart_time, 1));
                                }
                                Some(entry) => {
                                    let since_first_sec = (trip_depart_time - entry.0) * 60.0;
                                    if fp.transfers > 0
                                        && entry.1 as i32 <= fp.transfers
                                        && (fp.transfer_duration < 0.0
                                            || since_first_sec <= fp.transfer_duration)
                                    {
                                        link_fare = 0.0;
                                    }
                                    entry.1 += 1;
                                }
                            }
                            link_attr.insert("fare".to_owned(), link_fare);
                            last_fare_period = Some(fp.fare_period.clone());
                        }
                        None => {
                            link_fare = 0.0;
                            last_fare_period = None;
                        }
                    }
                    self.weighted_cost(
                        supply,
                        spec,
                        LinkMode::Transit,
                        &spec.transit_mode,
                        supply_mode,
                        &link_attr,
                        trace,
                    )
                }
            };

            self.cost += link_cost;
            self.fare += link_fare;
            let link = &mut self.links[index].1;
            link.link_cost = link_cost;
            link.link_fare = link_fare;
            link.cost = self.cost;
        }

        if trace.enabled() {
            let line = format!(" => recalculated cost: {:.4}, fare: {:.2}", self.cost, self.fare);
            trace.writeln(&line);
        }
    }

    fn weighted_cost(
        &self,
        supply: &Supply,
        spec: &PathSpecification,
        demand_mode_type: LinkMode,
        demand_mode: &str,
        supply_mode: u32,
        attributes: &Attributes,
        trace: &mut TraceLog,
    ) -> f64 {
        let key = WeightKey {
            user_class: spec.user_class.clone(),
            purpose: spec.purpose.clone(),
            demand_mode_type,
            demand_mode: demand_mode.to_owned(),
        };
        match supply.named_weights(&key, supply_mode) {
            Some(weights) => tally_link_cost(supply_mode, supply, weights, attributes, trace),
            None => {
                log::warn!(
                    "no weights for user class {} {:?} mode {demand_mode}",
                    spec.user_class,
                    demand_mode_type
                );
                0.0
            }
        }
    }

    /// Board stops, trips, and alight stops in travel order, for the
    /// path-set file.
    pub fn summary_fields(&self, supply: &Supply) -> (String, String, String) {
        let mut board_stops = String::new();
        let mut trips = String::new();
        let mut alight_stops = String::new();
        let count = self.links.len();
        for step in 0..count {
            let index = if self.outbound { step } else { count - 1 - step };
            let (stop_id, ss) = &self.links[index];
            if !ss.mode.is_trip() {
                continue;
            }
            if !board_stops.is_empty() {
                board_stops.push(',');
                trips.push(',');
                alight_stops.push(',');
            }
            let (board, alight) =
                if self.outbound { (*stop_id, ss.stop_succpred) } else { (ss.stop_succpred, *stop_id) };
            board_stops.push_str(&supply.stop_str(board));
            trips.push_str(&supply.trip_str(ss.trip_id));
            alight_stops.push_str(&supply.stop_str(alight));
        }
        if board_stops.is_empty() {
            return ("no_path".to_owned(), String::new(), String::new());
        }
        (board_stops, trips, alight_stops)
    }

    #[cfg(test)]
    pub(crate) fn push_link_raw(&mut self, stop_id: StopId, ss: StopState) {
        self.cost += ss.link_cost;
        self.fare += ss.link_fare;
        self.links.push((stop_id, ss));
    }
}

// Paths sort by cost, then size, then per-link (stop, mode, trip); this also
// defines equality for de-duplication in the stochastic path set.
impl Ord for Path {
    fn cmp(&self, other: &Path) -> Ordering {
        self.cost
            .total_cmp(&other.cost)
            .then_with(|| self.links.len().cmp(&other.links.len()))
            .then_with(|| {
                for (a, b) in self.links.iter().zip(other.links.iter()) {
                    let link_order = a
                        .0
                        .cmp(&b.0)
                        .then_with(|| a.1.mode.cmp(&b.1.mode))
                        .then_with(|| a.1.trip_id.cmp(&b.1.trip_id));
                    if link_order != Ordering::Equal {
                        return link_order;
                    }
                }
                Ordering::Equal
            })
    }
}

impl PartialOrd for Path {
    fn partial_cmp(&self, other: &Path) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Path) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Path {}

/// A set of unique paths mapping to the information collected about them
/// (for choosing one). De-duplication uses the path ordering above, so two
/// walks that produce the same link sequence land on one entry.
#[derive(Debug, Default)]
pub struct PathSet {
    paths: BTreeMap<Path, PathInfo>,
}

impl PathSet {
    pub fn new() -> PathSet {
        PathSet::default()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Count another occurrence of the path, inserting it on first sight.
    pub fn tally(&mut self, path: Path) {
        match self.paths.get_mut(&path) {
            Some(info) => info.count += 1,
            None => {
                self.paths.insert(path, PathInfo { count: 1, ..PathInfo::default() });
            }
        }
    }

    pub fn insert(&mut self, path: Path, info: PathInfo) {
        self.paths.insert(path, info);
    }

    /// Paths in cost order with their info.
    pub fn iter(&self) -> impl Iterator<Item = (&Path, &PathInfo)> {
        self.paths.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&Path, &mut PathInfo)> {
        self.paths.iter_mut()
    }
}

impl IntoIterator for PathSet {
    type Item = (Path, PathInfo);
    type IntoIter = std::collections::btree_map::IntoIter<Path, PathInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.paths.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supply::{FareTransfer, TimePeriod, TripStopTime, Weight};
    use assert_approx_eq::assert_approx_eq;

    fn spec(outbound: bool) -> PathSpecification {
        PathSpecification {
            iteration: 1,
            pathfinding_iteration: 1,
            hyperpath: true,
            origin_taz_id: 100,
            destination_taz_id: 200,
            outbound,
            preferred_time: 555.0,
            value_of_time: 10.0,
            trace: false,
            path_id: 7,
            person_id: "p1".to_owned(),
            person_trip_id: "p1-t1".to_owned(),
            user_class: "all".to_owned(),
            purpose: "work".to_owned(),
            access_mode: "walk".to_owned(),
            transit_mode: "transit".to_owned(),
            egress_mode: "walk".to_owned(),
        }
    }

    fn weight_key(demand_mode_type: LinkMode, demand_mode: &str) -> WeightKey {
        WeightKey {
            user_class: "all".to_owned(),
            purpose: "work".to_owned(),
            demand_mode_type,
            demand_mode: demand_mode.to_owned(),
        }
    }

    fn linear(pairs: &[(&str, f64)]) -> crate::supply::NamedWeights {
        pairs.iter().map(|(name, value)| (name.to_string(), Weight::linear(*value))).collect()
    }

    fn attrs(pairs: &[(&str, f64)]) -> Attributes {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    // Supply with one fare period "peak" (price 2.5, 1 free transfer within
    // an hour) and three boardable trips on route 1.
    fn fare_supply() -> Supply {
        let mut supply = Supply::new();
        supply.add_supply_mode(1, "walk");
        supply.add_supply_mode(2, "transfer");
        supply.add_supply_mode(3, "local_bus");
        for stop in [1u32, 2, 3, 4, 5, 6] {
            supply.add_stop(stop, &format!("S{stop}"), 1);
        }
        supply.add_route(1, "R1");
        for (trip, board_stop, alight_stop, board_dep, alight_arr) in [
            (11u32, 1u32, 2u32, 480.0, 490.0),
            (12, 3, 4, 510.0, 520.0),
            (13, 5, 6, 550.0, 560.0),
        ] {
            supply.add_trip(trip, &format!("T{trip}"), 1, 3, Attributes::new());
            supply.add_trip_stop_time(TripStopTime {
                trip_id: trip,
                seq: 1,
                stop_id: board_stop,
                arrive_time: board_dep,
                depart_time: board_dep,
                shape_dist_trav: 0.0,
                overcap: -1.0,
            });
            supply.add_trip_stop_time(TripStopTime {
                trip_id: trip,
                seq: 2,
                stop_id: alight_stop,
                arrive_time: alight_arr,
                depart_time: alight_arr,
                shape_dist_trav: 1.0,
                overcap: -1.0,
            });
        }
        supply.add_fare_period(
            1,
            -1,
            -1,
            FarePeriod {
                fare_id: "peak".to_owned(),
                fare_period: "peak".to_owned(),
                period: TimePeriod::ALL_DAY,
                price: 2.5,
                transfers: 1,
                transfer_duration: 3600.0,
            },
        );
        supply.add_weights(
            weight_key(LinkMode::Transit, "transit"),
            3,
            linear(&[("in_vehicle_time_min", 1.0), ("wait_time_min", 1.0), ("fare", 1.0)]),
        );
        supply.add_weights(
            weight_key(LinkMode::Transfer, "transfer"),
            2,
            linear(&[("time_min", 1.0)]),
        );
        supply
    }

    fn trip_link(supply: &Supply, trip_id: u32, alight_stop: StopId) -> StopState {
        let board = supply.trip_stop_time(trip_id, 1).unwrap().clone();
        let alight = supply.trip_stop_time(trip_id, 2).unwrap().clone();
        let fare_period = supply.find_fare_period(1, 1, 1, board.depart_time);
        StopState {
            deparr_time: board.depart_time,
            mode: LinkMode::Transit,
            trip_id,
            stop_succpred: alight_stop,
            seq: 1,
            seq_succpred: 2,
            link_time: alight.arrive_time - board.depart_time,
            link_fare: 2.5,
            link_cost: 10.0,
            link_dist: 1.0,
            cost: 0.0,
            iteration: 1,
            arrdep_time: alight.arrive_time,
            fare_period,
            probability: 0.0,
            cum_prob_i: None,
        }
    }

    #[test]
    fn free_transfer_within_fare_period() {
        // three boards in "peak": first pays 2.5, second is the free
        // transfer, third exceeds the allowance and pays again
        let supply = fare_supply();
        let spec = spec(true);
        let config = Config::default();
        let mut trace = TraceLog::off(&supply);

        let mut path = Path::new(true, true);
        path.push_link_raw(1, trip_link(&supply, 11, 2));
        path.push_link_raw(3, trip_link(&supply, 12, 4));
        path.push_link_raw(5, trip_link(&supply, 13, 6));

        path.calculate_cost(&supply, &spec, &config, &mut trace);

        let fares: Vec<f64> = path.links().iter().map(|(_, ss)| ss.link_fare).collect();
        assert_approx_eq!(fares[0], 2.5);
        assert_approx_eq!(fares[1], 0.0);
        assert_approx_eq!(fares[2], 2.5);
        assert_approx_eq!(path.fare(), 5.0);
    }

    #[test]
    fn per_board_fare_never_exceeds_base_price() {
        let supply = fare_supply();
        let spec = spec(true);
        let config = Config::default();
        let mut trace = TraceLog::off(&supply);

        let mut path = Path::new(true, true);
        path.push_link_raw(1, trip_link(&supply, 11, 2));
        path.push_link_raw(3, trip_link(&supply, 12, 4));
        path.push_link_raw(5, trip_link(&supply, 13, 6));
        path.calculate_cost(&supply, &spec, &config, &mut trace);

        for (_, ss) in path.links() {
            assert!(ss.link_fare <= 2.5 + 1e-12);
            assert!(ss.link_fare >= 0.0);
        }
    }

    #[test]
    fn calculate_cost_is_idempotent() {
        let supply = fare_supply();
        let spec = spec(true);
        let config = Config::default();
        let mut trace = TraceLog::off(&supply);

        let mut path = Path::new(true, true);
        path.push_link_raw(1, trip_link(&supply, 11, 2));
        path.push_link_raw(3, trip_link(&supply, 12, 4));

        path.calculate_cost(&supply, &spec, &config, &mut trace);
        let (first_cost, first_fare) = (path.cost(), path.fare());
        path.calculate_cost(&supply, &spec, &config, &mut trace);
        assert_eq!(path.cost(), first_cost);
        assert_eq!(path.fare(), first_fare);
    }

    #[test]
    fn fare_transfer_rules_adjust_the_price() {
        let mut supply = fare_supply();
        supply.add_fare_period(
            1,
            -1,
            -1,
            FarePeriod {
                fare_id: "offpeak".to_owned(),
                fare_period: "offpeak".to_owned(),
                period: TimePeriod::ALL_DAY,
                price: 2.0,
                transfers: 0,
                transfer_duration: -1.0,
            },
        );

        let peak = supply.fare_period(0).clone();
        assert_approx_eq!(fare_with_transfer(&supply, None, &peak), 2.5);

        supply.add_fare_transfer(
            "offpeak",
            "peak",
            FareTransfer { transfer_type: FareTransferType::Discount, amount: 1.0 },
        );
        assert_approx_eq!(fare_with_transfer(&supply, Some("offpeak"), &peak), 1.5);

        supply.add_fare_transfer(
            "peak",
            "peak",
            FareTransfer { transfer_type: FareTransferType::Free, amount: 0.0 },
        );
        assert_approx_eq!(fare_with_transfer(&supply, Some("peak"), &peak), 0.0);

        supply.add_fare_transfer(
            "offpeak",
            "offpeak",
            FareTransfer { transfer_type: FareTransferType::SetCost, amount: 0.75 },
        );
        let offpeak = supply.fare_period(1).clone();
        assert_approx_eq!(fare_with_transfer(&supply, Some("offpeak"), &offpeak), 0.75);

        // discounts never push the fare negative
        supply.add_fare_transfer(
            "peak",
            "offpeak",
            FareTransfer { transfer_type: FareTransferType::Discount, amount: 5.0 },
        );
        assert_approx_eq!(fare_with_transfer(&supply, Some("peak"), &offpeak), 0.0);
    }

    #[test]
    fn chrono_access_snaps_to_scheduled_departure() {
        // outbound enumeration is chronological: access, trip, egress
        let supply = fare_supply();
        let spec = spec(true);
        let mut trace = TraceLog::off(&supply);
        let mut path = Path::new(true, true);

        let access = StopState {
            deparr_time: 470.0,
            mode: LinkMode::Access,
            trip_id: 1,
            stop_succpred: 1,
            seq: -1,
            seq_succpred: -1,
            link_time: 5.0,
            link_fare: 0.0,
            link_cost: 5.0,
            link_dist: 0.0,
            cost: 5.0,
            iteration: 0,
            arrdep_time: 475.0,
            fare_period: None,
            probability: 0.0,
            cum_prob_i: None,
        };
        assert!(path.add_link(100, &access, &supply, &spec, &mut trace));
        assert!(path.add_link(1, &trip_link(&supply, 11, 2), &supply, &spec, &mut trace));

        // access arrival snapped to the 08:00 departure
        let (_, access_after) = &path.links()[0];
        assert_approx_eq!(access_after.arrdep_time, 480.0);
        assert_approx_eq!(access_after.deparr_time, 475.0);
        // no wait on the boarded trip
        let (_, trip_after) = &path.links()[1];
        assert_approx_eq!(trip_after.link_time, 10.0);

        let egress = StopState {
            deparr_time: 491.0,
            mode: LinkMode::Egress,
            trip_id: 1,
            stop_succpred: 200,
            seq: -1,
            seq_succpred: -1,
            link_time: 5.0,
            link_fare: 0.0,
            link_cost: 5.0,
            link_dist: 0.0,
            cost: 20.0,
            iteration: 0,
            arrdep_time: 496.0,
            fare_period: None,
            probability: 0.0,
            cum_prob_i: None,
        };
        assert!(path.add_link(2, &egress, &supply, &spec, &mut trace));
        let (_, egress_after) = &path.links()[2];
        // walk starts at the 08:10 arrival
        assert_approx_eq!(egress_after.deparr_time, 490.0);
        assert_approx_eq!(egress_after.arrdep_time, 495.0);
    }

    #[test]
    fn out_of_order_trip_is_infeasible() {
        let supply = fare_supply();
        let spec = spec(true);
        let mut trace = TraceLog::off(&supply);
        let mut path = Path::new(true, true);

        // trip 12 (dep 08:30) then trip 11 (dep 08:00, arriving before we
        // get there): infeasible
        assert!(path.add_link(3, &trip_link(&supply, 12, 4), &supply, &spec, &mut trace));
        let feasible = path.add_link(1, &trip_link(&supply, 11, 2), &supply, &spec, &mut trace);
        assert!(!feasible);
    }

    #[test]
    fn path_set_dedups_by_cost_then_links() {
        let supply = fare_supply();
        let mut a = Path::new(true, true);
        a.push_link_raw(1, trip_link(&supply, 11, 2));
        let mut b = Path::new(true, true);
        b.push_link_raw(1, trip_link(&supply, 11, 2));
        let mut c = Path::new(true, true);
        c.push_link_raw(3, trip_link(&supply, 12, 4));

        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = PathSet::new();
        set.tally(a);
        set.tally(b);
        set.tally(c);
        assert_eq!(set.len(), 2);
        let counts: Vec<u32> = set.iter().map(|(_, info)| info.count).collect();
        assert_eq!(counts.iter().sum::<u32>(), 3);
        assert_eq!(counts.iter().copied().max(), Some(2));
    }

    #[test]
    fn boards_per_fare_period_counts_appended_links() {
        let supply = fare_supply();
        let spec = spec(true);
        let mut trace = TraceLog::off(&supply);
        let mut path = Path::new(true, true);
        path.add_link(1, &trip_link(&supply, 11, 2), &supply, &spec, &mut trace);
        path.add_link(3, &trip_link(&supply, 12, 4), &supply, &spec, &mut trace);
        assert_eq!(path.boards_for_fare_period("peak"), 2);
        assert_eq!(path.boards_for_fare_period("offpeak"), 0);
    }

    #[test]
    fn fix_time_range_wraps_into_a_day() {
        assert_eq!(fix_time_range(0.0), 0.0);
        assert_eq!(fix_time_range(-5.0), 1435.0);
        assert_eq!(fix_time_range(1440.0), 0.0);
        assert_eq!(fix_time_range(2885.0), 5.0);
    }
}
