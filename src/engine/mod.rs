mod bluegreen;
mod deployer;
mod events;
mod fetcher;
mod prechecker;
mod pusher;
mod sink;

pub use bluegreen::*;
pub use deployer::*;
pub use events::*;
pub use fetcher::*;
pub use prechecker::*;
pub use pusher::*;
pub use sink::*;
