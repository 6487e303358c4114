use crate::hyperlink::{
    AddLinkOutcome, Hyperlink, LinkMode, StopState, StopStates, MAX_COST, PROB_SCALE,
};
use crate::path::{Path, PathInfo, PathSet};
use crate::queue::{LabelStop, LabelStopQueue, QueueError};
use crate::request::{Config, PathSpecification, PerformanceInfo};
use crate::supply::{Attributes, NamedWeights, StopId, Supply, SupplyModeId, WeightKey};
use crate::trace::TraceLog;
use std::time::Instant;

/// Defensive bound on reconstruction walks; a path with more links than this
/// means the labeled state graph is corrupt.
const MAX_PATH_LINKS: usize = 100;

#[derive(thiserror::Error, Debug)]
pub enum PathfindingError {
    /// No usable access/egress links or weights to seed labeling from.
    #[error("no links or weights to initialize labeling")]
    InitStopStates,
    /// The zone where the path must end has no stops connecting it.
    #[error("no final stops are reachable from the ending zone")]
    SetReachable,
    /// Labeling drained without ever reaching the final zone.
    #[error("the ending zone was not reached")]
    EndNotFound,
    /// Every reconstruction attempt was infeasible or aborted.
    #[error("no paths could be generated")]
    NoPathsGenerated,
    /// The sampled path set carries no probability mass.
    #[error("path set has no probability")]
    NoPathProbability,
    /// A labeled stop disappeared or a side emptied out mid-algorithm;
    /// implies a programming bug, not bad input.
    #[error("unexpected labeling state: {0}")]
    UnexpectedState(&'static str),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub type PathfindingResult = Result<PathSetResult, PathfindingError>;

/// Everything a request returns: the chosen path, its info, the unique path
/// set behind it (a single entry for deterministic requests), and timings.
#[derive(Debug)]
pub struct PathSetResult {
    pub path: Path,
    pub info: PathInfo,
    pub path_set: PathSet,
    pub performance: PerformanceInfo,
}

/// Sum of the weighted link attributes. A weight whose attribute is missing
/// is logged and contributes nothing.
pub(crate) fn tally_link_cost(
    supply_mode: SupplyModeId,
    supply: &Supply,
    weights: &NamedWeights,
    attributes: &Attributes,
    trace: &mut TraceLog,
) -> f64 {
    let mut cost = 0.0;
    if trace.enabled() {
        trace.writeln(&format!("Link cost for {:<15}", supply.mode_str(supply_mode)));
    }
    for (name, weight) in weights {
        match attributes.get(name) {
            None => {
                log::warn!(
                    "no attribute called {name} on a {} link",
                    supply.mode_str(supply_mode)
                );
                if trace.enabled() {
                    trace.writeln(&format!(" => NO ATTRIBUTE CALLED {name}"));
                }
            }
            Some(&value) => {
                cost += weight.apply(value);
                if trace.enabled() {
                    trace.writeln(&format!(
                        "{name:>26}:  + {:13.4} x {value}",
                        weight.value
                    ));
                }
            }
        }
    }
    if trace.enabled() {
        trace.writeln(&format!("{:>26}:  = {cost:13.4}", "final cost"));
    }
    cost
}

/// Request-local labeling state, bundled so it can move through the
/// algorithm as one unit.
struct LabelRun<'a> {
    spec: &'a PathSpecification,
    trace: TraceLog<'a>,
    stop_states: StopStates,
    queue: LabelStopQueue,
}

/// The transit path-finding core. Holds references to the immutable supply
/// and configuration; each request allocates its own labeling state, so one
/// PathFinder may serve concurrent requests from multiple threads.
pub struct PathFinder<'a> {
    supply: &'a Supply,
    config: &'a Config,
}

impl<'a> PathFinder<'a> {
    pub fn new(supply: &'a Supply, config: &'a Config) -> PathFinder<'a> {
        PathFinder { supply, config }
    }

    fn weight_key(
        spec: &PathSpecification,
        demand_mode_type: LinkMode,
        demand_mode: &str,
    ) -> WeightKey {
        WeightKey {
            user_class: spec.user_class.clone(),
            purpose: spec.purpose.clone(),
            demand_mode_type,
            demand_mode: demand_mode.to_owned(),
        }
    }

    /// Find the path set. This method is the whole point of our existence.
    pub fn find_path_set(&self, spec: &PathSpecification) -> PathfindingResult {
        let mut run = LabelRun {
            spec,
            trace: TraceLog::new(self.supply, self.config, spec),
            stop_states: StopStates::new(),
            queue: LabelStopQueue::new(),
        };
        run.trace.request_echo(spec);

        let mut performance = PerformanceInfo::default();
        let labeling_start = Instant::now();

        if !self.initialize_stop_states(&mut run) {
            return Err(PathfindingError::InitStopStates);
        }
        self.check_reachable_final_stops(spec)?;

        performance.label_iterations =
            self.label_stops(&mut run, &mut performance.max_process_count)?;
        self.finalize_taz_state(&mut run, performance.label_iterations);

        performance.num_labeled_stops = run.stop_states.len() as u32;
        performance.milliseconds_labeling = labeling_start.elapsed().as_millis() as u64;

        let enumerating_start = Instant::now();
        let extracted = self.extract_path(&mut run);
        performance.milliseconds_enumerating = enumerating_start.elapsed().as_millis() as u64;
        let (path, info, path_set) = extracted?;

        run.trace.performance(&performance);
        Ok(PathSetResult { path, info, path_set, performance })
    }

    /// Seed the stop states from the egress (outbound) or access (inbound)
    /// links of the TAZ the labeling starts from. Fails only when there is
    /// nothing to seed with.
    fn initialize_stop_states(&self, run: &mut LabelRun) -> bool {
        let spec = run.spec;
        let seed_taz = if spec.outbound { spec.destination_taz_id } else { spec.origin_taz_id };
        let dir_factor = spec.dir_factor();

        if !self.supply.access_egress().has_links_for_taz(seed_taz) {
            return false;
        }
        let demand_mode_type = if spec.outbound { LinkMode::Egress } else { LinkMode::Access };
        let demand_mode = if spec.outbound { &spec.egress_mode } else { &spec.access_mode };
        let key = Self::weight_key(spec, demand_mode_type, demand_mode);
        let Some(mode_weights) = self.supply.supply_mode_weights(&key) else {
            log::warn!(
                "no weights configured for user class [{}], {demand_mode_type:?} mode [{demand_mode}]",
                spec.user_class
            );
            return false;
        };

        run.trace.stop_label(seed_taz, 0);

        for (&supply_mode, weights) in mode_weights {
            for (stop_id, periods) in self.supply.access_egress().links_for(seed_taz, supply_mode) {
                let Some(attributes) = crate::supply::resolve_period(periods, spec.preferred_time)
                else {
                    continue;
                };
                let mut link_attr = attributes.clone();
                let Some(&attr_time) = link_attr.get("time_min") else {
                    log::warn!("access/egress link without time_min at stop {stop_id}");
                    continue;
                };
                // outbound: departure time = preferred arrival - access time
                // inbound:  arrival time   = preferred departure + access time
                let deparr_time = spec.preferred_time - attr_time * dir_factor;
                // we start out with no delay
                link_attr.insert("preferred_delay_min".to_owned(), 0.0);

                let cost = if spec.hyperpath {
                    tally_link_cost(supply_mode, self.supply, weights, &link_attr, &mut run.trace)
                } else {
                    attr_time
                };

                let ss = StopState {
                    deparr_time,
                    mode: demand_mode_type,
                    trip_id: supply_mode,
                    stop_succpred: seed_taz,
                    seq: -1,
                    seq_succpred: -1,
                    link_time: attr_time,
                    link_fare: 0.0,
                    link_cost: cost,
                    link_dist: link_attr.get("dist").copied().unwrap_or(0.0),
                    cost,
                    iteration: 0,
                    arrdep_time: spec.preferred_time,
                    fare_period: None,
                    probability: 0.0,
                    cum_prob_i: None,
                };
                self.add_stop_state(run, stop_id, ss);
            }
        }
        !run.queue.is_empty()
    }

    /// The stops linked to the TAZ the path must end at; fails when the zone
    /// is unreachable no matter how labeling goes.
    fn check_reachable_final_stops(&self, spec: &PathSpecification) -> Result<(), PathfindingError> {
        let final_taz = if spec.outbound { spec.origin_taz_id } else { spec.destination_taz_id };
        let demand_mode_type = if spec.outbound { LinkMode::Access } else { LinkMode::Egress };
        let demand_mode = if spec.outbound { &spec.access_mode } else { &spec.egress_mode };
        let key = Self::weight_key(spec, demand_mode_type, demand_mode);

        if let Some(mode_weights) = self.supply.supply_mode_weights(&key) {
            for &supply_mode in mode_weights.keys() {
                if self.supply.access_egress().links_for(final_taz, supply_mode).next().is_some() {
                    return Ok(());
                }
            }
        }
        Err(PathfindingError::SetReachable)
    }

    /// Offer a link to the stop's hyperlink; when the side's label or window
    /// moved, requeue the stop for processing.
    fn add_stop_state(&self, run: &mut LabelRun, stop_id: StopId, ss: StopState) {
        let hyperlink =
            run.stop_states.entry(stop_id).or_insert_with(|| Hyperlink::new(stop_id));
        let is_trip = ss.mode.is_trip();
        let AddLinkOutcome { state_changed, rejected } =
            hyperlink.add_link(ss.clone(), run.spec, self.config, &mut run.trace);
        let label = hyperlink.hyperpath_cost(is_trip);
        if state_changed {
            run.queue.push(LabelStop { label, stop_id, is_trip });
        }
        if !rejected {
            run.trace.label_link(stop_id, &ss);
        }
    }

    /// The main labeling loop: pop the lowest valid (stop, side), relax
    /// transfer edges from trip-side labels and trip edges from non-trip-side
    /// labels, until the queue drains.
    fn label_stops(
        &self,
        run: &mut LabelRun,
        max_process_count: &mut u32,
    ) -> Result<u32, PathfindingError> {
        let mut label_iterations: u32 = 1;
        let mut last_popped: Option<(StopId, bool)> = None;

        while !run.queue.is_empty() {
            let current = run.queue.pop_top()?;

            // re-processing the stop we just processed is a no-op
            if last_popped == Some((current.stop_id, current.is_trip)) {
                continue;
            }

            if run.spec.hyperpath {
                let cap = self.config.stoch_max_stop_process_count;
                let hyperlink = run
                    .stop_states
                    .get_mut(&current.stop_id)
                    .ok_or(PathfindingError::UnexpectedState("popped stop was never labeled"))?;
                if cap > 0 && hyperlink.process_count(current.is_trip) == cap {
                    continue;
                }
                hyperlink.increment_process_count(current.is_trip);
                *max_process_count =
                    (*max_process_count).max(hyperlink.process_count(current.is_trip));
            }

            {
                let LabelRun { trace, stop_states, .. } = run;
                if trace.enabled() {
                    if let Some(hyperlink) = stop_states.get(&current.stop_id) {
                        trace.pop_snapshot(&current, label_iterations, hyperlink);
                    }
                    trace.stop_label(current.stop_id, label_iterations);
                }
            }

            if current.is_trip {
                self.update_stop_states_for_transfers(run, label_iterations, &current)?;
            } else {
                self.update_stop_states_for_trips(run, label_iterations, &current)?;
            }

            label_iterations += 1;
            last_popped = Some((current.stop_id, current.is_trip));
        }
        Ok(label_iterations)
    }

    /// Relax transfer edges out of a trip-side label: a zero-walk transfer
    /// at the stop itself, plus every configured transfer neighbor.
    fn update_stop_states_for_transfers(
        &self,
        run: &mut LabelRun,
        label_iteration: u32,
        current: &LabelStop,
    ) -> Result<(), PathfindingError> {
        let spec = run.spec;
        let dir_factor = spec.dir_factor();

        // the popped side is the trip side, so it has at least one state
        let (current_trip, current_seq, current_deparr_time, nonwalk_label) = {
            let hyperlink = run
                .stop_states
                .get(&current.stop_id)
                .ok_or(PathfindingError::UnexpectedState("transfer relaxation on unlabeled stop"))?;
            let lowest = hyperlink
                .lowest_cost_stop_state(true)
                .ok_or(PathfindingError::UnexpectedState("trip-side label with no trip links"))?;
            (lowest.trip_id, lowest.seq, lowest.deparr_time, hyperlink.hyperpath_cost(true))
        };

        let transfer_mode = self.supply.transfer_supply_mode();
        let key = Self::weight_key(spec, LinkMode::Transfer, "transfer");
        let Some(transfer_weights) = self.supply.named_weights(&key, transfer_mode) else {
            return Ok(());
        };

        // zero-walk transfer onto the non-trip side of this same stop
        let zero_walk = &self.config.zero_walk_transfer_attributes;
        let transfer_time = zero_walk.get("walk_time_min").copied().unwrap_or(0.0);
        let deparr_time = current_deparr_time - transfer_time * dir_factor;
        let (link_cost, cost) = if spec.hyperpath {
            let link_cost =
                tally_link_cost(transfer_mode, self.supply, transfer_weights, zero_walk, &mut run.trace);
            (link_cost, nonwalk_label + link_cost)
        } else {
            (transfer_time, current.label + transfer_time)
        };
        let ss = StopState {
            deparr_time,
            mode: LinkMode::Transfer,
            trip_id: transfer_mode,
            stop_succpred: current.stop_id,
            seq: -1,
            seq_succpred: -1,
            link_time: transfer_time,
            link_fare: 0.0,
            link_cost,
            link_dist: 0.0,
            cost,
            iteration: label_iteration,
            arrdep_time: current_deparr_time,
            fare_period: None,
            probability: 0.0,
            cum_prob_i: None,
        };
        self.add_stop_state(run, current.stop_id, ss);

        // configured transfers: outbound labels backwards, so walk transfers
        // TO this stop; inbound walks transfers FROM it
        let Some(transfers) = self.supply.transfer_links(current.stop_id, spec.outbound) else {
            return Ok(());
        };
        for (&xfer_stop_id, attributes) in transfers {
            let Some(&transfer_time) = attributes.get("time_min") else {
                continue;
            };
            // outbound: departure time = latest departure - transfer
            //  inbound: arrival time   = earliest arrival + transfer
            let mut deparr_time = current_deparr_time - transfer_time * dir_factor;

            let (link_cost, mut cost) = if spec.hyperpath {
                let mut link_attr = attributes.clone();
                link_attr.insert("transfer_penalty".to_owned(), 1.0);
                let link_cost = tally_link_cost(
                    transfer_mode,
                    self.supply,
                    transfer_weights,
                    &link_attr,
                    &mut run.trace,
                );
                (link_cost, nonwalk_label + link_cost)
            } else {
                (transfer_time, current.label + transfer_time)
            };

            // deterministic capacity steering, outbound only: if someone was
            // bumped here, either give up on the candidate or line up early
            // TODO: decide what the inbound analogue should be
            if !spec.hyperpath && spec.outbound {
                if let Some(latest_time) =
                    self.supply.bump_wait(current_trip, current_seq, current.stop_id)
                {
                    // we can't come in time
                    if deparr_time - self.config.time_window > latest_time {
                        continue;
                    }
                    cost += (current_deparr_time - latest_time) + self.config.bump_buffer;
                    deparr_time = latest_time - transfer_time - self.config.bump_buffer;
                }
            }

            let ss = StopState {
                deparr_time,
                mode: LinkMode::Transfer,
                trip_id: transfer_mode,
                stop_succpred: current.stop_id,
                seq: -1,
                seq_succpred: -1,
                link_time: transfer_time,
                link_fare: 0.0,
                link_cost,
                link_dist: attributes.get("dist").copied().unwrap_or(0.0),
                cost,
                iteration: label_iteration,
                arrdep_time: current_deparr_time,
                fare_period: None,
                probability: 0.0,
                cum_prob_i: None,
            };
            self.add_stop_state(run, xfer_stop_id, ss);
        }
        Ok(())
    }

    /// Relax trip edges out of a non-trip-side label: every trip serving the
    /// stop within the time window, at every boarding (outbound) or
    /// alighting (inbound) position.
    fn update_stop_states_for_trips(
        &self,
        run: &mut LabelRun,
        label_iteration: u32,
        current: &LabelStop,
    ) -> Result<(), PathfindingError> {
        let spec = run.spec;
        let dir_factor = spec.dir_factor();

        let key = Self::weight_key(spec, LinkMode::Transit, &spec.transit_mode);
        let Some(transit_weights) = self.supply.supply_mode_weights(&key) else {
            return Ok(());
        };

        let latest_dep_earliest_arr = {
            let hyperlink = run
                .stop_states
                .get(&current.stop_id)
                .ok_or(PathfindingError::UnexpectedState("trip relaxation on unlabeled stop"))?;
            hyperlink.latest_departure_earliest_arrival(false)
        };

        let relevant_trips = self.supply.trips_within_time(
            current.stop_id,
            spec.outbound,
            latest_dep_earliest_arr,
            self.config.time_window,
        );

        for trip_stop in &relevant_trips {
            let Some(trip_info) = self.supply.trip_info(trip_stop.trip_id) else {
                continue;
            };
            // this supply mode may not be allowed for the user class
            let Some(named_weights) = transit_weights.get(&trip_info.supply_mode) else {
                continue;
            };

            // trip arrival (outbound) or departure (inbound) at this stop
            let arrdep_time =
                if spec.outbound { trip_stop.arrive_time } else { trip_stop.depart_time };

            let (best_guess, lowest_nontrip, nontrip_hyperpath_cost) = {
                let hyperlink = run.stop_states.get(&current.stop_id).ok_or(
                    PathfindingError::UnexpectedState("trip relaxation on unlabeled stop"),
                )?;
                let best_guess = hyperlink
                    .best_guess_link(spec.outbound, arrdep_time)
                    .ok_or(PathfindingError::UnexpectedState("non-trip label with no links"))?
                    .clone();
                let lowest = hyperlink
                    .lowest_cost_stop_state(false)
                    .ok_or(PathfindingError::UnexpectedState("non-trip label with no links"))?
                    .clone();
                (best_guess, lowest, hyperlink.hyperpath_cost(false))
            };

            let wait_time = (best_guess.deparr_time - arrdep_time) * dir_factor;
            if wait_time < 0.0 {
                log::warn!("negative wait against trip {}", trip_stop.trip_id);
            }

            // deterministic: skip a trip a bumped passenger is still waiting
            // for, unless it's the one we're already on
            if !spec.hyperpath {
                let (check_trip, check_seq, arrive_time) = if spec.outbound {
                    (lowest_nontrip.trip_id, lowest_nontrip.seq, arrdep_time)
                } else {
                    (trip_stop.trip_id, trip_stop.seq, lowest_nontrip.deparr_time)
                };
                if let Some(latest_time) =
                    self.supply.bump_wait(check_trip, check_seq, current.stop_id)
                {
                    if arrive_time + 0.01 >= latest_time
                        && lowest_nontrip.trip_id != trip_stop.trip_id
                    {
                        continue;
                    }
                }
            }

            let Some(all_stop_times) = self.supply.trip_stop_times(trip_stop.trip_id) else {
                continue;
            };

            // boarding positions before this stop for outbound, alighting
            // positions after it for inbound
            let (start_seq, end_seq) = if spec.outbound {
                (1, trip_stop.seq - 1)
            } else {
                (trip_stop.seq + 1, all_stop_times.len() as i32)
            };
            for seq_num in start_seq..=end_seq {
                let board_alight = &all_stop_times[(seq_num - 1) as usize];
                let mut deparr_time = if spec.outbound {
                    board_alight.depart_time
                } else {
                    board_alight.arrive_time
                };
                // the schedule crossed midnight
                if spec.outbound && arrdep_time < deparr_time {
                    deparr_time -= 24.0 * 60.0;
                } else if !spec.outbound && deparr_time < arrdep_time {
                    deparr_time += 24.0 * 60.0;
                }
                let in_vehicle_time = (arrdep_time - deparr_time) * dir_factor;
                if in_vehicle_time < 0.0 {
                    log::warn!("negative in-vehicle time on trip {}", trip_stop.trip_id);
                }

                let (link_cost, cost) = if spec.hyperpath {
                    let mut link_attr = trip_info.attributes.clone();
                    link_attr.insert("in_vehicle_time_min".to_owned(), in_vehicle_time);
                    link_attr.insert("wait_time_min".to_owned(), wait_time);

                    let mut link_cost = 0.0;
                    // If the best guess is the final walk link, the wait time
                    // isn't real; it's slack against the preferred time, so
                    // weight it as a preferred delay instead.
                    if (spec.outbound && best_guess.mode == LinkMode::Egress)
                        || (!spec.outbound && best_guess.mode == LinkMode::Access)
                    {
                        link_attr.insert("wait_time_min".to_owned(), 0.0);
                        let mut delay_attr = Attributes::new();
                        delay_attr.insert("time_min".to_owned(), 0.0);
                        delay_attr.insert("preferred_delay_min".to_owned(), wait_time);
                        let delay_key = Self::weight_key(
                            spec,
                            if spec.outbound { LinkMode::Egress } else { LinkMode::Access },
                            if spec.outbound { &spec.egress_mode } else { &spec.access_mode },
                        );
                        if let Some(delay_weights) =
                            self.supply.named_weights(&delay_key, best_guess.trip_id)
                        {
                            link_cost = tally_link_cost(
                                best_guess.trip_id,
                                self.supply,
                                delay_weights,
                                &delay_attr,
                                &mut run.trace,
                            );
                        }
                    }

                    let from_walk = matches!(best_guess.mode, LinkMode::Access | LinkMode::Egress);
                    link_attr
                        .insert("transfer_penalty".to_owned(), if from_walk { 0.0 } else { 1.0 });

                    link_cost += tally_link_cost(
                        trip_info.supply_mode,
                        self.supply,
                        named_weights,
                        &link_attr,
                        &mut run.trace,
                    );
                    (link_cost, nontrip_hyperpath_cost + link_cost)
                } else {
                    let link_cost = in_vehicle_time + wait_time;
                    (link_cost, lowest_nontrip.cost + link_cost)
                };

                let (board, alight) = if spec.outbound {
                    (board_alight, trip_stop)
                } else {
                    (trip_stop, board_alight)
                };
                let fare_period = self.supply.find_fare_period(
                    trip_info.route_id,
                    self.supply.stop_zone(board.stop_id),
                    self.supply.stop_zone(alight.stop_id),
                    board.depart_time,
                );
                let link_fare =
                    fare_period.map_or(0.0, |idx| self.supply.fare_period(idx).price);

                let ss = StopState {
                    deparr_time,
                    mode: LinkMode::Transit,
                    trip_id: trip_stop.trip_id,
                    stop_succpred: current.stop_id,
                    seq: board_alight.seq,
                    seq_succpred: trip_stop.seq,
                    link_time: in_vehicle_time + wait_time,
                    link_fare,
                    link_cost,
                    link_dist: alight.shape_dist_trav - board.shape_dist_trav,
                    cost,
                    iteration: label_iteration,
                    arrdep_time,
                    fare_period,
                    probability: 0.0,
                    cum_prob_i: None,
                };
                self.add_stop_state(run, board_alight.stop_id, ss);
            }
        }
        Ok(())
    }

    /// The reverse of initialization: once the stops are labeled, reach the
    /// TAZ the path must end at through its access (outbound) or egress
    /// (inbound) links.
    fn finalize_taz_state(&self, run: &mut LabelRun, label_iteration: u32) {
        let spec = run.spec;
        let final_taz = if spec.outbound { spec.origin_taz_id } else { spec.destination_taz_id };
        let dir_factor = spec.dir_factor();

        if !self.supply.access_egress().has_links_for_taz(final_taz) {
            return;
        }
        let demand_mode_type = if spec.outbound { LinkMode::Access } else { LinkMode::Egress };
        let demand_mode = if spec.outbound { &spec.access_mode } else { &spec.egress_mode };
        let key = Self::weight_key(spec, demand_mode_type, demand_mode);
        let Some(mode_weights) = self.supply.supply_mode_weights(&key) else {
            log::warn!(
                "no weights configured for user class [{}], {demand_mode_type:?} mode [{demand_mode}]",
                spec.user_class
            );
            return;
        };

        run.trace.stop_label(final_taz, label_iteration);

        for (&supply_mode, weights) in mode_weights {
            for (stop_id, periods) in self.supply.access_egress().links_for(final_taz, supply_mode) {
                let Some(hyperlink) = run.stop_states.get(&stop_id) else {
                    continue;
                };
                // not reachable by any trip: not a viable final stop
                if hyperlink.size(true) == 0 {
                    continue;
                }
                let lowest_trip = match hyperlink.lowest_cost_stop_state(true) {
                    Some(ss) => ss.clone(),
                    None => continue,
                };

                let mut earliest_dep_latest_arr = lowest_trip.deparr_time;
                let Some(attributes) =
                    crate::supply::resolve_period(periods, earliest_dep_latest_arr)
                else {
                    continue;
                };
                let mut link_attr = attributes.clone();
                link_attr.insert("preferred_delay_min".to_owned(), 0.0);
                let Some(&access_time) = link_attr.get("time_min") else {
                    log::warn!("access/egress link without time_min at stop {stop_id}");
                    continue;
                };

                let mut deparr_time;
                let link_cost;
                let mut cost;
                if spec.hyperpath {
                    earliest_dep_latest_arr = match hyperlink
                        .earliest_departure_latest_arrival(spec.outbound, true)
                    {
                        Some(time) => time,
                        None => continue,
                    };
                    let nonwalk_label = hyperlink.hyperpath_cost(true);
                    // reachable only by walking; don't walk again
                    if nonwalk_label >= MAX_COST {
                        continue;
                    }
                    deparr_time = earliest_dep_latest_arr - access_time * dir_factor;
                    link_cost = tally_link_cost(
                        supply_mode,
                        self.supply,
                        weights,
                        &link_attr,
                        &mut run.trace,
                    );
                    cost = nonwalk_label + link_cost;
                } else {
                    deparr_time = earliest_dep_latest_arr - access_time * dir_factor;
                    // the first leg out of the TAZ has to be a trip
                    if !lowest_trip.mode.is_trip() {
                        continue;
                    }
                    link_cost = access_time;
                    cost = lowest_trip.cost + link_cost;

                    // outbound-only capacity steering, as at transfers
                    if spec.outbound {
                        if let Some(latest_time) =
                            self.supply.bump_wait(lowest_trip.trip_id, lowest_trip.seq, stop_id)
                        {
                            if deparr_time - self.config.time_window > latest_time {
                                continue;
                            }
                            cost += (lowest_trip.deparr_time - latest_time)
                                + self.config.bump_buffer;
                            deparr_time = latest_time - access_time - self.config.bump_buffer;
                        }
                    }
                }

                let ss = StopState {
                    deparr_time,
                    mode: demand_mode_type,
                    trip_id: supply_mode,
                    stop_succpred: stop_id,
                    seq: -1,
                    seq_succpred: -1,
                    link_time: access_time,
                    link_fare: 0.0,
                    link_cost,
                    link_dist: link_attr.get("dist").copied().unwrap_or(0.0),
                    cost,
                    iteration: label_iteration,
                    arrdep_time: earliest_dep_latest_arr,
                    fare_period: None,
                    probability: 0.0,
                    cum_prob_i: None,
                };
                self.add_stop_state(run, final_taz, ss);
            }
        }
    }

    fn extract_path(
        &self,
        run: &mut LabelRun,
    ) -> Result<(Path, PathInfo, PathSet), PathfindingError> {
        let spec = run.spec;
        let final_taz = if spec.outbound { spec.origin_taz_id } else { spec.destination_taz_id };
        match run.stop_states.get(&final_taz) {
            None => return Err(PathfindingError::EndNotFound),
            Some(hyperlink) if hyperlink.is_empty() => return Err(PathfindingError::EndNotFound),
            Some(_) => {}
        }
        if spec.hyperpath {
            self.hyperpath_path_set(run, final_taz)
        } else {
            self.deterministic_path(run, final_taz)
        }
    }

    /// Deterministic trace-back: alternate sides from the final TAZ until
    /// the terminal walk link appears.
    fn deterministic_path(
        &self,
        run: &mut LabelRun,
        final_taz: StopId,
    ) -> Result<(Path, PathInfo, PathSet), PathfindingError> {
        let spec = run.spec;
        let terminal_mode = if spec.outbound { LinkMode::Egress } else { LinkMode::Access };
        let mut path = Path::new(spec.outbound, true);

        let first = run
            .stop_states
            .get(&final_taz)
            .and_then(|hyperlink| hyperlink.lowest_cost_stop_state(false))
            .ok_or(PathfindingError::NoPathsGenerated)?
            .clone();
        let mut feasible = path.add_link(final_taz, &first, self.supply, spec, &mut run.trace);

        while path.back().map(|(_, ss)| ss.mode) != Some(terminal_mode) {
            if path.len() > MAX_PATH_LINKS {
                return Err(PathfindingError::NoPathsGenerated);
            }
            let last = match path.back() {
                Some((_, ss)) => ss.clone(),
                None => return Err(PathfindingError::NoPathsGenerated),
            };
            let stop_id = last.stop_succpred;
            // the finalized TAZ's lowest-cost walk link must lead into a
            // stop whose opposite side is populated
            let next = run
                .stop_states
                .get(&stop_id)
                .and_then(|hyperlink| hyperlink.lowest_cost_stop_state(!last.mode.is_trip()))
                .ok_or(PathfindingError::UnexpectedState(
                    "trace-back stepped into a stop with an empty side",
                ))?
                .clone();
            feasible &= path.add_link(stop_id, &next, self.supply, spec, &mut run.trace);
        }

        if !feasible {
            return Err(PathfindingError::NoPathsGenerated);
        }
        path.calculate_cost(self.supply, spec, self.config, &mut run.trace);
        run.trace.path_snapshot("Final path", &path);

        let info = PathInfo {
            count: 1,
            cost: path.cost(),
            capacity_problem: path.capacity_problem(),
            probability: 1.0,
            prob_i: 0,
        };
        let mut path_set = PathSet::new();
        path_set.insert(path.clone(), info.clone());
        Ok((path, info, path_set))
    }

    /// One random walk over the labeled hyperpath. Ok(true) when a complete
    /// feasible path landed in `path`.
    fn hyperpath_generate_path(
        &self,
        run: &mut LabelRun,
        final_taz: StopId,
        rng: &mut fastrand::Rng,
        path: &mut Path,
    ) -> Result<bool, PathfindingError> {
        let spec = run.spec;
        let taz_hyperlink = run
            .stop_states
            .get_mut(&final_taz)
            .ok_or(PathfindingError::EndNotFound)?;
        if taz_hyperlink.setup_probabilities(false, spec, self.config, None, None) == 0 {
            return Ok(false);
        }
        let first = match taz_hyperlink.choose_state(false, rng) {
            Some(ss) => ss.clone(),
            None => return Ok(false),
        };
        let mut feasible = path.add_link(final_taz, &first, self.supply, spec, &mut run.trace);

        loop {
            let last = match path.back() {
                Some((_, ss)) => ss.clone(),
                None => return Ok(false),
            };
            if path.len() > MAX_PATH_LINKS {
                return Ok(false);
            }
            let current_stop_id = last.stop_succpred;
            let Some(hyperlink) = run.stop_states.get_mut(&current_stop_id) else {
                return Ok(false);
            };
            let side_is_trip = !last.mode.is_trip();
            let last_trip_id = path.last_added_trip().map(|(_, ss)| ss.trip_id);
            if hyperlink.setup_probabilities(side_is_trip, spec, self.config, Some(&last), last_trip_id)
                == 0
            {
                return Ok(false);
            }
            let next = match hyperlink.choose_state(side_is_trip, rng) {
                Some(ss) => ss.clone(),
                None => return Ok(false),
            };
            feasible &= path.add_link(current_stop_id, &next, self.supply, spec, &mut run.trace);

            let done = (spec.outbound && next.mode == LinkMode::Egress)
                || (!spec.outbound && next.mode == LinkMode::Access);
            if done {
                break;
            }
        }
        Ok(feasible)
    }

    /// Sample the hyperpath into a de-duplicated path set, recompute each
    /// unique path's cost, and draw the returned path from the logsum
    /// probabilities.
    fn hyperpath_path_set(
        &self,
        run: &mut LabelRun,
        final_taz: StopId,
    ) -> Result<(Path, PathInfo, PathSet), PathfindingError> {
        let theta = self.config.stoch_dispersion;
        let mut rng = fastrand::Rng::with_seed(run.spec.path_id);
        let mut sampled = PathSet::new();

        for _attempt in 0..self.config.stoch_pathset_size {
            if self.config.max_num_paths > 0
                && sampled.len() as u32 >= self.config.max_num_paths
            {
                break;
            }
            let mut path = Path::new(run.spec.outbound, true);
            if self.hyperpath_generate_path(run, final_taz, &mut rng, &mut path)? {
                sampled.tally(path);
            }
        }
        if sampled.is_empty() {
            return Err(PathfindingError::NoPathsGenerated);
        }

        // recompute the costs now that each path is concrete; the cost is
        // part of the ordering, so this builds a fresh set
        let mut pathset = PathSet::new();
        let mut logsum = 0.0;
        for (mut path, mut info) in sampled {
            path.calculate_cost(self.supply, run.spec, self.config, &mut run.trace);
            info.cost = path.cost();
            info.capacity_problem = path.capacity_problem();
            if info.cost > 0.0 {
                logsum += (-theta * info.cost).exp();
            }
            pathset.insert(path, info);
        }
        if logsum == 0.0 {
            return Err(PathfindingError::NoPathProbability);
        }

        let mut cum_prob: u64 = 0;
        for (path, info) in pathset.iter_mut() {
            info.probability = (-theta * info.cost).exp() / logsum;
            let prob_i = (PROB_SCALE as f64 * info.probability) as u64;
            // too small to consider
            if prob_i < 1 || info.probability < self.config.min_path_probability {
                continue;
            }
            cum_prob += prob_i;
            info.prob_i = cum_prob;
            if run.trace.enabled() {
                let (boards, trips, alights) = path.summary_fields(self.supply);
                let line = format!(
                    "-> probability {:8.6}; prob_i {:>12}; count {:>4}; cost {:8.2}   {} {} {}",
                    info.probability, info.prob_i, info.count, info.cost, boards, trips, alights
                );
                run.trace.writeln(&line);
            }
        }
        if cum_prob == 0 {
            return Err(PathfindingError::NoPathProbability);
        }

        for (path, info) in pathset.iter() {
            if info.prob_i > 0 {
                run.trace.pathset_entry(run.spec, path, info);
            }
        }

        let draw = rng.u64(0..cum_prob);
        let mut chosen = None;
        for (path, info) in pathset.iter() {
            if info.prob_i == 0 {
                continue;
            }
            if draw <= info.prob_i {
                run.trace.path_snapshot("Final path", path);
                chosen = Some((path.clone(), info.clone()));
                break;
            }
        }
        match chosen {
            Some((path, info)) => Ok((path, info, pathset)),
            None => Err(PathfindingError::NoPathProbability),
        }
    }
}
