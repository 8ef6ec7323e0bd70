use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::{
    sensors::HourlyAverage,
    types::{Metric, StatusSnapshot},
};

pub const HEADER: &str = concat!(
    "Date\tTime\tRed\tGreen\tBlue\tWhite\tVolts\tMilliamps\tWatts\t",
    "Fan\tFanRPM\tTemperature\tHumidity\tSoilMoisture",
);

#[derive(Debug, Clone)]
pub struct HourlyLog {
    dir: PathBuf,
    retention: usize,
}

impl HourlyLog {
    pub fn new(dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            dir: dir.into(),
            retention,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, snapshot: &StatusSnapshot) -> PathBuf {
        self.dir.join(format!("{}.txt", snapshot.date()))
    }

    pub fn append(
        &self,
        snapshot: &StatusSnapshot,
        average: &HourlyAverage,
    ) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(snapshot);
        let fresh = !path.exists();

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if fresh {
            writeln!(file, "{HEADER}")?;
        }
        writeln!(file, "{}", row(snapshot, average))?;
        debug!("appended hourly row to {}", path.display());
        Ok(path)
    }

    // File names are dates, so name order is age order.
    pub fn prune(&self) -> io::Result<usize> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name());
            }
        }
        if names.len() <= self.retention {
            return Ok(0);
        }

        names.sort();
        let excess = names.len() - self.retention;
        for name in &names[..excess] {
            fs::remove_file(self.dir.join(name))?;
        }
        info!("pruned {excess} old log file(s)");
        Ok(excess)
    }
}

/// Temperature is always the air sensor average, even when only soil
/// temperature was measured.
pub fn row(snapshot: &StatusSnapshot, average: &HourlyAverage) -> String {
    let whole = |metric| average.get(metric).round() as i64;
    format!(
        "{}\t{}\t{}\t{}\t{}\t{}\t{:.2}\t{}\t{:.2}\t{}\t{}\t{:.2}\t{:.2}\t{}",
        snapshot.date(),
        snapshot.hour_minute(),
        whole(Metric::Red),
        whole(Metric::Green),
        whole(Metric::Blue),
        whole(Metric::White),
        average.get(Metric::Volts),
        whole(Metric::Milliamps),
        average.get(Metric::Watts),
        whole(Metric::Fan),
        whole(Metric::FanRpm),
        average.get(Metric::Temperature),
        average.get(Metric::Humidity),
        whole(Metric::SoilMoisture),
    )
}
