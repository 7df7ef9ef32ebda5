pub mod order_worker;
pub mod reclaimer;
