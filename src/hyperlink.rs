use crate::request::{Config, PathSpecification};
use crate::supply::{SeqNum, StopId, TripId};
use crate::trace::TraceLog;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

/// Hyperpath cost when a side holds no links.
pub const MAX_COST: f64 = 999_999.0;
/// Hyperpath minimum cost; zero and negative costs blow up the log domain.
pub const MIN_COST: f64 = 0.001;
/// Scale for integerized cumulative probabilities.
pub(crate) const PROB_SCALE: u64 = u32::MAX as u64;

/// What kind of link a stop state describes. The trip/non-trip split used
/// throughout labeling is a single-bit projection of this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LinkMode {
    Access,
    Egress,
    Transfer,
    Transit,
}

impl LinkMode {
    #[inline]
    pub fn is_trip(self) -> bool {
        matches!(self, LinkMode::Transit)
    }
}

/// Uniquely identifies a candidate link into/out of a stop. Two distinct
/// boardings of different trips at the same stop produce distinct keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StopStateKey {
    /// Departure mode for outbound, arrival mode for inbound.
    pub mode: LinkMode,
    /// Trip id if the mode is Transit, otherwise the supply mode number.
    pub trip_id: TripId,
    /// Successor stop for outbound, predecessor stop for inbound.
    pub stop_succpred: StopId,
    /// Sequence number of this stop on the trip (-1 if not a trip link).
    pub seq: SeqNum,
    /// Sequence number of the successor/predecessor stop.
    pub seq_succpred: SeqNum,
}

/// A link in the hyperpath: the state of a stop with details of the link
/// after it (outbound) or before it (inbound).
///
/// The time fields are based around the preferred arrival or departure time
/// and can be negative or over 24*60 when travel crosses midnight. For trip
/// states both times are for the *vehicle*; passenger times are inferred from
/// the surrounding states.
#[derive(Debug, Clone)]
pub struct StopState {
    /// Departure time for outbound, arrival time for inbound.
    pub deparr_time: f64,
    pub mode: LinkMode,
    /// Trip id if mode is Transit, otherwise the supply mode number.
    pub trip_id: TripId,
    pub stop_succpred: StopId,
    pub seq: SeqNum,
    pub seq_succpred: SeqNum,
    /// Link time. Includes wait time for trips, just walk time otherwise.
    pub link_time: f64,
    pub link_fare: f64,
    /// Link generalized cost.
    pub link_cost: f64,
    /// Link distance, in units of shape_dist_traveled.
    pub link_dist: f64,
    /// Cost from previous link(s) and this link together.
    pub cost: f64,
    /// Labeling iteration that generated this stop state.
    pub iteration: u32,
    /// Arrival time for outbound, departure time for inbound.
    pub arrdep_time: f64,
    /// Trip links may carry a fare period (index into the supply).
    pub fare_period: Option<usize>,
    pub probability: f64,
    /// Cumulative integerized probability; None when inadmissible.
    pub cum_prob_i: Option<u64>,
}

impl StopState {
    pub fn key(&self) -> StopStateKey {
        StopStateKey {
            mode: self.mode,
            trip_id: self.trip_id,
            stop_succpred: self.stop_succpred,
            seq: self.seq,
            seq_succpred: self.seq_succpred,
        }
    }
}

/// Cost as an ordered map key. Costs never hold NaN once stored, so
/// total_cmp yields the stable total order the cost map needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct OrderedCost(pub f64);

impl Eq for OrderedCost {}

impl Ord for OrderedCost {
    fn cmp(&self, other: &OrderedCost) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for OrderedCost {
    fn partial_cmp(&self, other: &OrderedCost) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The outcome of offering a link to a hyperlink.
#[derive(Debug, Clone, Copy)]
pub struct AddLinkOutcome {
    /// The side's label or window moved; the stop needs reprocessing.
    pub state_changed: bool,
    /// The link was not admitted (diagnostic only, not an error).
    pub rejected: bool,
}

/// One side of a hyperlink: either all trip links or all non-trip links at a
/// stop, reduced to a running log-sum cost.
#[derive(Debug)]
pub struct LinkSet {
    /// Latest departure from this stop for outbound, earliest arrival for
    /// inbound; anchors the time window.
    latest_dep_earliest_arr: f64,
    /// Key of the state producing the anchor.
    lder_key: Option<StopStateKey>,
    /// Running sum of exp(-theta * cost) over the contained states.
    sum_exp_cost: f64,
    hyperpath_cost: f64,
    process_count: u32,
    max_cum_prob_i: u64,
    states: HashMap<StopStateKey, StopState>,
    // Ties on cost break by the key's secondary ordering.
    cost_map: BTreeSet<(OrderedCost, StopStateKey)>,
}

impl LinkSet {
    fn new() -> LinkSet {
        LinkSet {
            latest_dep_earliest_arr: 0.0,
            lder_key: None,
            sum_exp_cost: 0.0,
            hyperpath_cost: MAX_COST,
            process_count: 0,
            max_cum_prob_i: 0,
            states: HashMap::new(),
            cost_map: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn insert_state(&mut self, ss: StopState) {
        let key = ss.key();
        self.cost_map.insert((OrderedCost(ss.cost), key));
        self.states.insert(key, ss);
    }

    fn remove_state(&mut self, key: &StopStateKey) -> Option<StopState> {
        let ss = self.states.remove(key)?;
        let removed = self.cost_map.remove(&(OrderedCost(ss.cost), *key));
        debug_assert!(removed);
        Some(ss)
    }

    fn clear(&mut self) {
        self.states.clear();
        self.cost_map.clear();
        self.sum_exp_cost = 0.0;
        self.hyperpath_cost = 0.0;
        self.latest_dep_earliest_arr = 0.0;
        self.lder_key = None;
        // process counts survive a clear
    }

    /// States in cost-ascending order, ties broken by key.
    pub fn iter_by_cost(&self) -> impl Iterator<Item = &StopState> {
        self.cost_map.iter().filter_map(|(_, key)| self.states.get(key))
    }

    fn lowest(&self) -> Option<&StopState> {
        let (_, key) = self.cost_map.first()?;
        self.states.get(key)
    }

    /// Rescan for the window anchor: the max departure over states for
    /// outbound, the min arrival for inbound.
    fn reset_anchor(&mut self, outbound: bool) {
        self.lder_key = None;
        self.latest_dep_earliest_arr = 0.0;
        for (key, ss) in &self.states {
            let replace = match self.lder_key {
                None => true,
                Some(_) => {
                    (outbound && ss.deparr_time > self.latest_dep_earliest_arr)
                        || (!outbound && ss.deparr_time < self.latest_dep_earliest_arr)
                }
            };
            if replace {
                self.latest_dep_earliest_arr = ss.deparr_time;
                self.lder_key = Some(*key);
            }
        }
    }

    fn outside_window(&self, outbound: bool, window: f64, deparr_time: f64) -> bool {
        (outbound && deparr_time < self.latest_dep_earliest_arr - window)
            || (!outbound && deparr_time > self.latest_dep_earliest_arr + window)
    }

    /// Remove every state outside the time window. Recalculates sum_exp_cost
    /// (but not hyperpath_cost; the caller re-derives it).
    fn prune_window(&mut self, outbound: bool, window: f64, theta: f64) -> Vec<StopState> {
        let mut prune_keys = Vec::new();
        self.sum_exp_cost = 0.0;
        for (key, ss) in &self.states {
            if self.outside_window(outbound, window, ss.deparr_time) {
                prune_keys.push(*key);
            } else {
                self.sum_exp_cost += (-theta * ss.cost).exp();
            }
        }
        let mut pruned = Vec::with_capacity(prune_keys.len());
        for key in prune_keys {
            if let Some(ss) = self.remove_state(&key) {
                pruned.push(ss);
            }
        }
        pruned
    }

    /// Set up the link probabilities.
    ///
    /// Without a previous link, each state's probability comes straight from
    /// the side's log-sum cost. With a previous link (path enumeration),
    /// candidates are filtered for feasibility against it and normalized with
    /// a fresh denominator. Returns the side's max cumulative integer
    /// probability; 0 means nothing is admissible.
    fn setup_probabilities(
        &mut self,
        outbound: bool,
        theta: f64,
        prev_link: Option<&StopState>,
        last_trip_id: Option<TripId>,
    ) -> u64 {
        let keys: Vec<StopStateKey> = self.cost_map.iter().map(|(_, key)| *key).collect();

        let mut valid_links = 0u32;
        let mut sum_exp = 0.0;
        self.max_cum_prob_i = 0;
        let hyperpath_cost = self.hyperpath_cost;

        for key in &keys {
            let Some(ss) = self.states.get_mut(key) else { continue };
            ss.probability = 0.0;
            ss.cum_prob_i = None;

            if let Some(prev) = prev_link {
                // infinite cost is inadmissible
                if ss.cost >= MAX_COST {
                    continue;
                }
                // outbound: we cannot depart before we arrive
                if outbound && ss.deparr_time < prev.arrdep_time {
                    continue;
                }
                // inbound: we cannot arrive after we depart
                if !outbound && ss.deparr_time > prev.arrdep_time {
                    continue;
                }
                // don't ride the same trip twice in a row
                if ss.mode.is_trip() && Some(ss.trip_id) == last_trip_id {
                    continue;
                }
                ss.cum_prob_i = Some(0);
                sum_exp += (-theta * ss.cost).exp();
                valid_links += 1;
            } else if ss.cost < MAX_COST {
                let probability = (-theta * ss.cost).exp() / (-theta * hyperpath_cost).exp();
                // 0/0 from a degenerate denominator: coerce to nothing
                if probability.is_nan() {
                    ss.probability = 0.0;
                } else {
                    ss.probability = probability;
                    let prob_i = (PROB_SCALE as f64 * probability) as u64;
                    ss.cum_prob_i = Some(self.max_cum_prob_i + prob_i);
                    self.max_cum_prob_i += prob_i;
                    valid_links += 1;
                }
            }
        }

        if prev_link.is_none() || valid_links == 0 {
            return self.max_cum_prob_i;
        }
        if sum_exp.is_nan() {
            log::warn!("probability denominator is not a number; no admissible links");
            return self.max_cum_prob_i;
        }

        // second pass: normalize the admissible candidates
        for key in &keys {
            let Some(ss) = self.states.get_mut(key) else { continue };
            if ss.cum_prob_i.is_none() {
                continue;
            }
            ss.probability = (-theta * ss.cost).exp() / sum_exp;
            let prob_i = (PROB_SCALE as f64 * ss.probability) as u64;
            ss.cum_prob_i = Some(self.max_cum_prob_i + prob_i);
            self.max_cum_prob_i += prob_i;
        }
        self.max_cum_prob_i
    }

    /// Randomly select a state by cumulative probability. Call after
    /// setup_probabilities; None when nothing is admissible.
    fn choose_state(&self, rng: &mut fastrand::Rng) -> Option<&StopState> {
        if self.max_cum_prob_i == 0 {
            return None;
        }
        let draw = rng.u64(0..self.max_cum_prob_i);
        for ss in self.iter_by_cost() {
            match ss.cum_prob_i {
                None | Some(0) => continue,
                Some(cum) if draw <= cum => return Some(ss),
                Some(_) => {}
            }
        }
        log::error!("cumulative probability walk ran off the end; this should never happen");
        None
    }
}

/// The link (deterministic) or set of links within a time window (stochastic)
/// out of a stop (outbound) or into it (inbound), split into a trip side and
/// a non-trip side, each reduced to a single log-sum cost.
#[derive(Debug)]
pub struct Hyperlink {
    stop_id: StopId,
    linkset_trip: LinkSet,
    linkset_nontrip: LinkSet,
}

/// The labeled state of the network: one hyperlink per reached stop,
/// created lazily on first insert.
pub type StopStates = HashMap<StopId, Hyperlink>;

impl Hyperlink {
    pub fn new(stop_id: StopId) -> Hyperlink {
        Hyperlink { stop_id, linkset_trip: LinkSet::new(), linkset_nontrip: LinkSet::new() }
    }

    pub fn stop_id(&self) -> StopId {
        self.stop_id
    }

    fn linkset(&self, of_trip_links: bool) -> &LinkSet {
        if of_trip_links { &self.linkset_trip } else { &self.linkset_nontrip }
    }

    fn linkset_mut(&mut self, of_trip_links: bool) -> &mut LinkSet {
        if of_trip_links { &mut self.linkset_trip } else { &mut self.linkset_nontrip }
    }

    /// How many links make up the whole hyperlink?
    pub fn len(&self) -> usize {
        self.linkset_trip.len() + self.linkset_nontrip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many links make up the trip/non-trip side?
    pub fn size(&self, of_trip_links: bool) -> usize {
        self.linkset(of_trip_links).len()
    }

    pub fn hyperpath_cost(&self, of_trip_links: bool) -> f64 {
        self.linkset(of_trip_links).hyperpath_cost
    }

    pub fn process_count(&self, of_trip_links: bool) -> u32 {
        self.linkset(of_trip_links).process_count
    }

    pub fn increment_process_count(&mut self, of_trip_links: bool) {
        self.linkset_mut(of_trip_links).process_count += 1;
    }

    /// The side's window anchor.
    pub fn latest_departure_earliest_arrival(&self, of_trip_links: bool) -> f64 {
        self.linkset(of_trip_links).latest_dep_earliest_arr
    }

    /// The earliest departure (outbound) or latest arrival (inbound) over the
    /// side's links.
    pub fn earliest_departure_latest_arrival(&self, outbound: bool, of_trip_links: bool) -> Option<f64> {
        let linkset = self.linkset(of_trip_links);
        let mut result = linkset.lowest()?.deparr_time;
        for ss in linkset.states.values() {
            if outbound {
                result = result.min(ss.deparr_time);
            } else {
                result = result.max(ss.deparr_time);
            }
        }
        Some(result)
    }

    /// Lowest-cost state on the side; ties break by the key ordering.
    pub fn lowest_cost_stop_state(&self, of_trip_links: bool) -> Option<&StopState> {
        self.linkset(of_trip_links).lowest()
    }

    /// States on the side in cost-ascending order.
    pub fn states_by_cost(&self, of_trip_links: bool) -> impl Iterator<Item = &StopState> {
        self.linkset(of_trip_links).iter_by_cost()
    }

    /// Representative non-trip link for estimating the wait against a trip
    /// arriving (outbound) or departing (inbound) at arrdep_time: the
    /// cheapest state on the compatible side of that time, falling back to
    /// the cheapest overall.
    pub fn best_guess_link(&self, outbound: bool, arrdep_time: f64) -> Option<&StopState> {
        for ss in self.linkset_nontrip.iter_by_cost() {
            if outbound && ss.deparr_time >= arrdep_time {
                return Some(ss);
            }
            if !outbound && arrdep_time >= ss.deparr_time {
                return Some(ss);
            }
        }
        self.linkset_nontrip.lowest()
    }

    /// Add this link to the hyperlink.
    ///
    /// Deterministic: the side keeps only one link, accepted iff the cost is
    /// lower. Stochastic: reject outside the time window (except the final
    /// labeling link), insert or replace by key, shift the window and prune
    /// if the anchor moved, and re-derive the log-sum cost and probabilities.
    ///
    /// `state_changed` says whether the side's label or window moved, i.e.
    /// the stop needs reprocessing.
    pub fn add_link(
        &mut self,
        ss: StopState,
        spec: &PathSpecification,
        config: &Config,
        trace: &mut TraceLog,
    ) -> AddLinkOutcome {
        let key = ss.key();
        let of_trip_links = ss.mode.is_trip();
        let theta = config.stoch_dispersion;
        let stop_id = self.stop_id;

        // deterministic: we only keep the one lowest-cost link
        if !spec.hyperpath {
            if let Some(lowest) = self.linkset(of_trip_links).lowest() {
                if ss.cost >= lowest.cost {
                    trace.link_event(stop_id, &ss, " (rejected)");
                    return AddLinkOutcome { state_changed: false, rejected: true };
                }
            }
            self.linkset_mut(of_trip_links).clear();
        }

        let linkset = self.linkset_mut(of_trip_links);

        // simplest case: the side is empty, just take it
        if linkset.is_empty() {
            linkset.latest_dep_earliest_arr = ss.deparr_time;
            linkset.lder_key = Some(key);
            linkset.sum_exp_cost = (-theta * ss.cost).exp();
            linkset.hyperpath_cost = ss.cost.max(MIN_COST);
            let mut ss = ss;
            ss.probability = 1.0;
            trace.link_event(stop_id, &ss, "");
            linkset.insert_state(ss);
            return AddLinkOutcome { state_changed: true, rejected: false };
        }

        // the final labeling link (access for outbound, egress for inbound)
        // is exempt from the window
        let is_last_link = (spec.outbound && ss.mode == LinkMode::Access)
            || (!spec.outbound && ss.mode == LinkMode::Egress);

        // too early (outbound) or too late (inbound)
        if !is_last_link && linkset.outside_window(spec.outbound, config.time_window, ss.deparr_time)
        {
            trace.link_event(stop_id, &ss, " (rejected)");
            return AddLinkOutcome { state_changed: false, rejected: true };
        }

        let mut update_state = false;
        let mut notes = String::new();
        let previous = linkset.remove_state(&key);

        match previous {
            None => {
                linkset.insert_state(ss.clone());
                // did the window shift? then prune, which rebuilds the sum
                if !is_last_link
                    && ((spec.outbound && ss.deparr_time > linkset.latest_dep_earliest_arr)
                        || (!spec.outbound && ss.deparr_time < linkset.latest_dep_earliest_arr))
                {
                    linkset.latest_dep_earliest_arr = ss.deparr_time;
                    linkset.lder_key = Some(key);
                    update_state = true;
                    notes.push_str(" (window)");
                    for pruned in linkset.prune_window(spec.outbound, config.time_window, theta) {
                        trace.link_event(stop_id, &pruned, " (prune-window)");
                    }
                } else {
                    linkset.sum_exp_cost += (-theta * ss.cost).exp();
                }
            }
            Some(old) => {
                notes.push_str(" (sub)");
                linkset.sum_exp_cost -= (-theta * old.cost).exp();
                linkset.insert_state(ss.clone());
                linkset.sum_exp_cost += (-theta * ss.cost).exp();

                // the replaced state may have produced the anchor; the
                // rescan sees the replacement, so judge the window shift
                // against the anchor as it stood before
                let prior_anchor = linkset.latest_dep_earliest_arr;
                if linkset.lder_key == Some(key) {
                    linkset.reset_anchor(spec.outbound);
                }
                if !is_last_link
                    && ((spec.outbound && ss.deparr_time > prior_anchor)
                        || (!spec.outbound && ss.deparr_time < prior_anchor))
                {
                    linkset.latest_dep_earliest_arr = ss.deparr_time;
                    linkset.lder_key = Some(key);
                    update_state = true;
                    notes.push_str(" (window)");
                    for pruned in linkset.prune_window(spec.outbound, config.time_window, theta) {
                        trace.link_event(stop_id, &pruned, " (prune-window)");
                    }
                }
            }
        }

        let hyperpath_cost = ((-1.0 / theta) * linkset.sum_exp_cost.ln()).max(MIN_COST);
        if (hyperpath_cost - linkset.hyperpath_cost).abs() > 1e-4 {
            notes.push_str(&format!(
                " (hp cost {:.6}->{:.6})",
                linkset.hyperpath_cost, hyperpath_cost
            ));
            update_state = true;
            linkset.hyperpath_cost = hyperpath_cost;
        }

        linkset.setup_probabilities(spec.outbound, theta, None, None);

        if let Some(ss) = linkset.states.get(&key) {
            let ss = ss.clone();
            trace.link_event(stop_id, &ss, &notes);
        }
        AddLinkOutcome { state_changed: update_state, rejected: false }
    }

    /// See LinkSet::setup_probabilities.
    pub fn setup_probabilities(
        &mut self,
        of_trip_links: bool,
        spec: &PathSpecification,
        config: &Config,
        prev_link: Option<&StopState>,
        last_trip_id: Option<TripId>,
    ) -> u64 {
        self.linkset_mut(of_trip_links).setup_probabilities(
            spec.outbound,
            config.stoch_dispersion,
            prev_link,
            last_trip_id,
        )
    }

    /// See LinkSet::choose_state.
    pub fn choose_state(&self, of_trip_links: bool, rng: &mut fastrand::Rng) -> Option<&StopState> {
        self.linkset(of_trip_links).choose_state(rng)
    }

    #[cfg(test)]
    pub(crate) fn sum_exp_cost(&self, of_trip_links: bool) -> f64 {
        self.linkset(of_trip_links).sum_exp_cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn spec(hyperpath: bool, outbound: bool) -> PathSpecification {
        PathSpecification {
            iteration: 1,
            pathfinding_iteration: 1,
            hyperpath,
            origin_taz_id: 100,
            destination_taz_id: 200,
            outbound,
            preferred_time: 510.0,
            value_of_time: 10.0,
            trace: false,
            path_id: 1,
            person_id: "p1".to_owned(),
            person_trip_id: "p1-t1".to_owned(),
            user_class: "all".to_owned(),
            purpose: "work".to_owned(),
            access_mode: "walk".to_owned(),
            transit_mode: "transit".to_owned(),
            egress_mode: "walk".to_owned(),
        }
    }

    fn transfer_state(deparr_time: f64, cost: f64, succpred: StopId) -> StopState {
        StopState {
            deparr_time,
            mode: LinkMode::Transfer,
            trip_id: 1,
            stop_succpred: succpred,
            seq: -1,
            seq_succpred: -1,
            link_time: 2.0,
            link_fare: 0.0,
            link_cost: cost,
            link_dist: 0.0,
            cost,
            iteration: 1,
            arrdep_time: deparr_time + 2.0,
            fare_period: None,
            probability: 0.0,
            cum_prob_i: None,
        }
    }

    fn add(
        hyperlink: &mut Hyperlink,
        ss: StopState,
        spec: &PathSpecification,
        config: &Config,
    ) -> AddLinkOutcome {
        let supply = crate::supply::Supply::new();
        let mut trace = TraceLog::off(&supply);
        hyperlink.add_link(ss, spec, config, &mut trace)
    }

    #[test]
    fn deterministic_keeps_single_lowest_link() {
        let spec = spec(false, true);
        let config = Config::default();
        let mut hyperlink = Hyperlink::new(5);

        assert!(!add(&mut hyperlink, transfer_state(480.0, 10.0, 6), &spec, &config).rejected);
        let worse = add(&mut hyperlink, transfer_state(481.0, 12.0, 7), &spec, &config);
        assert!(worse.rejected && !worse.state_changed);
        let better = add(&mut hyperlink, transfer_state(482.0, 8.0, 8), &spec, &config);
        assert!(!better.rejected && better.state_changed);

        assert_eq!(hyperlink.size(false), 1);
        assert_eq!(hyperlink.lowest_cost_stop_state(false).unwrap().stop_succpred, 8);
        assert_approx_eq!(hyperlink.hyperpath_cost(false), 8.0);
    }

    #[test]
    fn window_shift_prunes_stale_states() {
        // outbound, theta = 1: anchor moves 100 -> 120 -> 150; the t=100
        // state falls outside the window once the anchor reaches 150, while
        // t=120 sits exactly on the boundary and survives
        let spec = spec(true, true);
        let config = Config::default();
        let mut hyperlink = Hyperlink::new(5);

        add(&mut hyperlink, transfer_state(100.0, 4.0, 1), &spec, &config);
        add(&mut hyperlink, transfer_state(120.0, 5.0, 2), &spec, &config);
        assert_eq!(hyperlink.size(false), 2);
        assert_approx_eq!(hyperlink.latest_departure_earliest_arrival(false), 120.0);

        add(&mut hyperlink, transfer_state(150.0, 6.0, 3), &spec, &config);
        assert_eq!(hyperlink.size(false), 2);
        assert_approx_eq!(hyperlink.latest_departure_earliest_arrival(false), 150.0);
        let remaining: Vec<f64> =
            hyperlink.states_by_cost(false).map(|ss| ss.deparr_time).collect();
        assert_eq!(remaining, vec![120.0, 150.0]);

        let expected_sum = (-5.0f64).exp() + (-6.0f64).exp();
        assert_approx_eq!(hyperlink.sum_exp_cost(false), expected_sum, 1e-9);
    }

    #[test]
    fn too_early_outbound_link_is_rejected() {
        let spec = spec(true, true);
        let config = Config::default();
        let mut hyperlink = Hyperlink::new(5);

        add(&mut hyperlink, transfer_state(480.0, 4.0, 1), &spec, &config);
        let outcome = add(&mut hyperlink, transfer_state(440.0, 1.0, 2), &spec, &config);
        assert!(outcome.rejected);
        assert_eq!(hyperlink.size(false), 1);
    }

    #[test]
    fn sum_exp_and_hyperpath_cost_stay_consistent() {
        let spec = spec(true, true);
        let config = Config::default();
        let theta = config.stoch_dispersion;
        let mut hyperlink = Hyperlink::new(5);
        let mut rng = fastrand::Rng::with_seed(0x5eed);

        for i in 0..60 {
            let deparr = 400.0 + rng.f64() * 80.0;
            let cost = 2.0 + rng.f64() * 12.0;
            add(&mut hyperlink, transfer_state(deparr, cost, i), &spec, &config);

            let expected: f64 =
                hyperlink.states_by_cost(false).map(|ss| (-theta * ss.cost).exp()).sum();
            assert_approx_eq!(hyperlink.sum_exp_cost(false), expected, 1e-9);

            let hp = hyperlink.hyperpath_cost(false);
            let formula = ((-1.0 / theta) * expected.ln()).max(MIN_COST);
            assert!(hp >= MIN_COST);
            assert_approx_eq!(hp, formula, 1e-9);

            // window invariant: every surviving state is in bounds
            let anchor = hyperlink.latest_departure_earliest_arrival(false);
            assert!(hyperlink
                .states_by_cost(false)
                .all(|ss| ss.deparr_time >= anchor - config.time_window));
        }
    }

    #[test]
    fn replacing_the_anchor_state_rescans() {
        let spec = spec(true, true);
        let config = Config::default();
        let mut hyperlink = Hyperlink::new(5);

        add(&mut hyperlink, transfer_state(100.0, 4.0, 1), &spec, &config);
        add(&mut hyperlink, transfer_state(110.0, 5.0, 2), &spec, &config);
        assert_approx_eq!(hyperlink.latest_departure_earliest_arrival(false), 110.0);

        // same key as the anchor state (succpred 2) but an earlier time
        add(&mut hyperlink, transfer_state(105.0, 5.5, 2), &spec, &config);
        assert_approx_eq!(hyperlink.latest_departure_earliest_arrival(false), 105.0);
        assert_eq!(hyperlink.size(false), 2);
    }

    #[test]
    fn replacing_the_anchor_with_a_later_time_prunes() {
        let spec = spec(true, true);
        let config = Config::default();
        let mut hyperlink = Hyperlink::new(5);

        add(&mut hyperlink, transfer_state(90.0, 4.0, 1), &spec, &config);
        add(&mut hyperlink, transfer_state(100.0, 5.0, 2), &spec, &config);
        assert_approx_eq!(hyperlink.latest_departure_earliest_arrival(false), 100.0);

        // the anchor state's own key superseded by a much later departure:
        // the window moves to 200 and the t=90 state must fall out
        let outcome = add(&mut hyperlink, transfer_state(200.0, 5.5, 2), &spec, &config);
        assert!(outcome.state_changed);
        assert_approx_eq!(hyperlink.latest_departure_earliest_arrival(false), 200.0);

        let remaining: Vec<f64> =
            hyperlink.states_by_cost(false).map(|ss| ss.deparr_time).collect();
        assert_eq!(remaining, vec![200.0]);
        assert_approx_eq!(hyperlink.sum_exp_cost(false), (-5.5f64).exp(), 1e-9);
    }

    #[test]
    fn unconditional_probabilities_normalize() {
        let spec = spec(true, true);
        let config = Config::default();
        let mut hyperlink = Hyperlink::new(5);

        for (i, cost) in [3.0, 4.0, 6.5].iter().enumerate() {
            add(&mut hyperlink, transfer_state(480.0 + i as f64, *cost, i as StopId), &spec, &config);
        }

        let total: f64 = hyperlink.states_by_cost(false).map(|ss| ss.probability).sum();
        assert_approx_eq!(total, 1.0, 1e-6);

        // cumulative integers are non-decreasing across the cost order
        let mut last = 0;
        for ss in hyperlink.states_by_cost(false) {
            let cum = ss.cum_prob_i.unwrap();
            assert!(cum >= last);
            last = cum;
        }
    }

    #[test]
    fn conditional_probabilities_filter_candidates() {
        let spec = spec(true, true);
        let config = Config::default();
        let mut hyperlink = Hyperlink::new(5);

        // trip side: two boardings, one departing before the previous link's
        // arrival (inadmissible outbound), plus a repeat of the same trip
        let trip = |trip_id: TripId, deparr: f64, cost: f64| StopState {
            deparr_time: deparr,
            mode: LinkMode::Transit,
            trip_id,
            stop_succpred: 9,
            seq: 1,
            seq_succpred: 3,
            link_time: 10.0,
            link_fare: 0.0,
            link_cost: cost,
            link_dist: 0.0,
            cost,
            iteration: 1,
            arrdep_time: deparr + 10.0,
            fare_period: None,
            probability: 0.0,
            cum_prob_i: None,
        };
        add(&mut hyperlink, trip(21, 490.0, 5.0), &spec, &config);
        add(&mut hyperlink, trip(22, 470.0, 4.0), &spec, &config);
        add(&mut hyperlink, trip(23, 492.0, 6.0), &spec, &config);

        let mut prev = transfer_state(480.0, 2.0, 5);
        prev.arrdep_time = 480.0;

        let max_cum = hyperlink.setup_probabilities(true, &spec, &config, Some(&prev), Some(23));
        assert!(max_cum > 0);

        let admissible: Vec<TripId> = hyperlink
            .states_by_cost(true)
            .filter(|ss| ss.cum_prob_i.is_some())
            .map(|ss| ss.trip_id)
            .collect();
        // 22 departs too early, 23 repeats the previous trip
        assert_eq!(admissible, vec![21]);
        let chosen_prob: f64 = hyperlink
            .states_by_cost(true)
            .filter(|ss| ss.cum_prob_i.is_some())
            .map(|ss| ss.probability)
            .sum();
        assert_approx_eq!(chosen_prob, 1.0, 1e-6);
    }

    #[test]
    fn choose_state_is_deterministic_per_seed() {
        let spec = spec(true, true);
        let config = Config::default();
        let mut hyperlink = Hyperlink::new(5);
        for (i, cost) in [3.0, 3.5, 5.0].iter().enumerate() {
            add(&mut hyperlink, transfer_state(480.0 + i as f64, *cost, i as StopId), &spec, &config);
        }

        let picks: Vec<StopId> = (0..8)
            .map(|_| {
                let mut rng = fastrand::Rng::with_seed(42);
                hyperlink.choose_state(false, &mut rng).unwrap().stop_succpred
            })
            .collect();
        assert!(picks.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn best_guess_link_prefers_compatible_times() {
        let spec = spec(true, true);
        let config = Config::default();
        let mut hyperlink = Hyperlink::new(5);

        add(&mut hyperlink, transfer_state(490.0, 6.0, 1), &spec, &config);
        add(&mut hyperlink, transfer_state(485.0, 2.0, 2), &spec, &config);

        // outbound, trip arrives 488: the cheap 485 link departs too early,
        // the 490 one works
        let guess = hyperlink.best_guess_link(true, 488.0).unwrap();
        assert_eq!(guess.stop_succpred, 1);

        // nothing departs at/after 495: fall back to the cheapest
        let fallback = hyperlink.best_guess_link(true, 495.0).unwrap();
        assert_eq!(fallback.stop_succpred, 2);
    }
}
