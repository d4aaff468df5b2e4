pub mod match_analysis;
