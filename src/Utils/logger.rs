use chrono::Local;
use csv::Writer;
use log::info;
use nalgebra::{DMatrix, DVector};
use simplelog::{
    ColorChoice, CombinedLogger, Config, LevelFilter, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::fs::File;
use std::io;

/// map loglevel string to LevelFilter; "off"/"none" disables logging entirely
pub fn level_filter_from_str(loglevel: &Option<String>) -> Option<LevelFilter> {
    let level = loglevel.clone().unwrap_or("info".to_string());
    match level.as_str() {
        "off" | "none" => None,
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "warn" => Some(LevelFilter::Warn),
        "error" => Some(LevelFilter::Error),
        _ => panic!("loglevel must be debug, info, warn or error"),
    }
}

/// initialize terminal logging (and optionally a timestamped log file);
/// repeated initialization is harmless - the second call is ignored
pub fn init_logging(loglevel: &Option<String>, log_to_file: bool) {
    let log_option = match level_filter_from_str(loglevel) {
        Some(level) => level,
        None => return,
    };
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        log_option,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if log_to_file {
        let date_and_time = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let name = format!("log_{}.txt", date_and_time);
        if let Ok(file) = File::create(&name) {
            loggers.push(WriteLogger::new(log_option, Config::default(), file));
        }
    }
    match CombinedLogger::init(loggers) {
        Ok(()) => info!("logging started with loglevel: {}", log_option),
        Err(_) => {} // logger already set
    }
}

/// save a named vector (gradient, parameter stash) into a two-column csv
pub fn save_vector_to_csv(
    vector: &DVector<f64>,
    names: &Vec<String>,
    filename: &str,
) -> io::Result<()> {
    assert_eq!(
        vector.len(),
        names.len(),
        "vector and names should have the same length."
    );
    let file = File::create(filename)?;
    let mut writer = Writer::from_writer(file);
    writer.write_record(&["name".to_string(), "value".to_string()])?;
    for (name, val) in names.iter().zip(vector.iter()) {
        writer.write_record(&[name.clone(), val.to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

/// save a trajectory matrix into csv: one row per stored time, first column
/// is the time, the rest are DOF values
pub fn save_trajectory_to_csv(
    trajectory: &DMatrix<f64>,
    times: &DVector<f64>,
    headers: &Vec<String>,
    filename: &str,
) -> io::Result<()> {
    assert_eq!(
        trajectory.ncols(),
        times.len(),
        "trajectory columns and times should have the same length."
    );
    let file = File::create(filename)?;
    let mut writer = Writer::from_writer(file);
    let mut headers_with_t = Vec::new();
    headers_with_t.push("time".to_string());
    headers_with_t.extend(headers.iter().cloned());
    writer.write_record(&headers_with_t)?;
    for (k, col) in trajectory.column_iter().enumerate() {
        let mut row_data = Vec::new();
        row_data.push(times[k].to_string());
        row_data.extend(col.iter().map(|&val| val.to_string()));
        writer.write_record(&row_data)?;
    }
    writer.flush()?;
    Ok(())
}
