pub mod supply;

pub use supply::Supply;

pub mod request;

pub use request::{Config, PathSpecification, PerformanceInfo};

pub mod queue;

pub use queue::LabelStopQueue;

pub mod hyperlink;

pub use hyperlink::{Hyperlink, LinkMode, StopState};

pub mod path;

pub use path::{Path, PathInfo, PathSet};

pub mod pathfinder;

pub use pathfinder::{PathFinder, PathSetResult, PathfindingError};

pub mod trace;
