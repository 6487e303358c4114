use crate::supply::{Attributes, StopId};
use std::path::PathBuf;

/// The definition of the path we're trying to find.
#[derive(Debug, Clone)]
pub struct PathSpecification {
    pub iteration: u32,
    pub pathfinding_iteration: u32,
    /// If true, find a path set using the stochastic hyperpath algorithm.
    pub hyperpath: bool,
    pub origin_taz_id: StopId,
    pub destination_taz_id: StopId,
    /// If true, the preferred time is a destination arrival time; otherwise
    /// it is an origin departure time.
    pub outbound: bool,
    /// Preferred arrival or departure time, minutes after midnight.
    pub preferred_time: f64,
    /// Value of time, in currency units per hour.
    pub value_of_time: f64,
    /// Log copious pathfinding detail into per-request trace files.
    /// Tracing never changes what the algorithm returns.
    pub trace: bool,
    /// Uniquely identifies a person trip across the whole run; also seeds
    /// the path-sampling PRNG.
    pub path_id: u64,
    pub person_id: String,
    pub person_trip_id: String,
    pub user_class: String,
    pub purpose: String,
    pub access_mode: String,
    pub transit_mode: String,
    pub egress_mode: String,
}

impl PathSpecification {
    /// Sign applied wherever a time difference is interpreted: +1 when
    /// labeling runs backwards in time (outbound), -1 forwards (inbound).
    pub fn dir_factor(&self) -> f64 {
        if self.outbound { 1.0 } else { -1.0 }
    }
}

/// Pathfinding parameters, set once per process and passed by reference.
#[derive(Debug, Clone)]
pub struct Config {
    /// Width of the time window for keeping candidate links at a stop, minutes.
    pub time_window: f64,
    /// Extra minutes to line up before a previously bumped passenger.
    pub bump_buffer: f64,
    /// Number of random walk attempts per stochastic request.
    pub stoch_pathset_size: u32,
    /// Dispersion parameter theta of the logit over link costs.
    pub stoch_dispersion: f64,
    /// Per-side cap on how often a stop may be processed in stochastic
    /// labeling. 0 means no cap.
    pub stoch_max_stop_process_count: u32,
    /// Stop sampling once this many distinct paths exist. 0 means no cap.
    pub max_num_paths: u32,
    /// Paths below this probability are dropped from the final draw.
    pub min_path_probability: f64,
    /// Minutes a passenger may depart before the preferred time without
    /// penalty (inbound).
    pub depart_early_allowed_min: f64,
    /// Minutes a passenger may arrive after the preferred time without
    /// penalty (outbound).
    pub arrive_late_allowed_min: f64,
    /// Attributes of the implicit zero-walk transfer at a single stop.
    pub zero_walk_transfer_attributes: Attributes,
    /// Directory for trace files.
    pub output_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Config {
        let mut zero_walk = Attributes::new();
        zero_walk.insert("walk_time_min".to_owned(), 0.0);
        zero_walk.insert("transfer_penalty".to_owned(), 1.0);
        Config {
            time_window: 30.0,
            bump_buffer: 5.0,
            stoch_pathset_size: 1000,
            stoch_dispersion: 1.0,
            stoch_max_stop_process_count: 20,
            max_num_paths: 0,
            min_path_probability: 0.0,
            depart_early_allowed_min: 0.0,
            arrive_late_allowed_min: 0.0,
            zero_walk_transfer_attributes: zero_walk,
            output_dir: PathBuf::from("."),
        }
    }
}

/// Performance counters returned with each request.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerformanceInfo {
    pub label_iterations: u32,
    pub num_labeled_stops: u32,
    pub max_process_count: u32,
    pub milliseconds_labeling: u64,
    pub milliseconds_enumerating: u64,
}
