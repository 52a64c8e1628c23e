pub mod disk;
pub mod speedtest;
