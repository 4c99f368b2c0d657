//! Periodic sampled-value generation.

use chrono::{SubsecRound, Utc};

use crate::ocpp::types::{Location, Measurand, MeterValue, ReadingContext, SampledValue, UnitOfMeasure};

/// Value advertised through the MeterValuesSampledData configuration key.
pub const METER_VALUES_SAMPLED_DATA: &str =
    "Power.Offered,Power.Active.Import,Energy.Active.Import.Register,Voltage,SoC";

/// Build the meter-value record for one sample of a connector.
///
/// The reported active import power mirrors the offered power; voltage and
/// state of charge are fixed stand-ins.
pub fn generate_meter_values(power_offered: f64, energy_import_register: f64) -> Vec<MeterValue> {
    vec![MeterValue {
        timestamp: Utc::now().trunc_subsecs(0),
        sampled_value: vec![
            sampled(Measurand::PowerActiveImport, UnitOfMeasure::W, round3(power_offered)),
            sampled(Measurand::PowerOffered, UnitOfMeasure::W, round3(power_offered)),
            sampled(
                Measurand::EnergyActiveImportRegister,
                UnitOfMeasure::Wh,
                round3(energy_import_register),
            ),
            sampled(Measurand::Voltage, UnitOfMeasure::V, "230".to_string()),
            sampled(Measurand::SoC, UnitOfMeasure::Percent, "0".to_string()),
        ],
    }]
}

fn sampled(measurand: Measurand, unit: UnitOfMeasure, value: String) -> SampledValue {
    SampledValue {
        value,
        context: Some(ReadingContext::SamplePeriodic),
        measurand: Some(measurand),
        location: Some(Location::Outlet),
        unit: Some(unit),
    }
}

/// Render a reading rounded to three decimals.
fn round3(value: f64) -> String {
    let rounded = (value * 1000.0).round() / 1000.0;
    rounded.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_record_with_five_ordered_samples() {
        let records = generate_meter_values(99.0, 123.456789);
        assert_eq!(records.len(), 1);

        let samples = &records[0].sampled_value;
        let measurands: Vec<_> = samples.iter().map(|s| s.measurand.unwrap()).collect();
        assert_eq!(
            measurands,
            vec![
                Measurand::PowerActiveImport,
                Measurand::PowerOffered,
                Measurand::EnergyActiveImportRegister,
                Measurand::Voltage,
                Measurand::SoC,
            ]
        );

        assert_eq!(samples[0].value, "99");
        assert_eq!(samples[1].value, "99");
        assert_eq!(samples[2].value, "123.457");
        assert_eq!(samples[3].value, "230");
        assert_eq!(samples[4].value, "0");

        for sample in samples {
            assert_eq!(sample.context, Some(ReadingContext::SamplePeriodic));
            assert_eq!(sample.location, Some(Location::Outlet));
        }
    }

    #[test]
    fn timestamp_has_second_resolution_with_zulu_suffix() {
        let records = generate_meter_values(0.0, 0.0);
        let value = serde_json::to_value(&records[0]).unwrap();
        let timestamp = value["timestamp"].as_str().unwrap();

        assert!(timestamp.ends_with('Z'), "timestamp was {timestamp}");
        assert!(!timestamp.contains('.'), "timestamp was {timestamp}");
        assert_eq!(timestamp.len(), "2024-01-01T00:00:00Z".len());
    }

    #[test]
    fn readings_round_to_three_decimals() {
        assert_eq!(round3(0.0001), "0");
        assert_eq!(round3(2.718281828), "2.718");
        assert_eq!(round3(99.9996), "100");
        assert_eq!(round3(500.0), "500");
    }
}
