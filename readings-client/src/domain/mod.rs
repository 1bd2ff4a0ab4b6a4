mod channel;
mod reading;

pub use channel::Channel;
pub use reading::Reading;
