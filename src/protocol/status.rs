// EMA Gateway
//
// Copyright: 2026, EMA Project
// License: Public Domain License

use nom::bytes::complete::{tag, take};
use nom::character::complete::one_of;
use nom::combinator::map_res;
use nom::IResult;
use serde::Serialize;

/// One decoded status bulletin: the canonical 17-field reading vector.
///
/// A field whose wire value fails range validation is `None` (missing)
/// without the whole frame being rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// Roof relay code as reported (`C` closed, `O` open)
    pub roof_relay: char,
    /// Auxiliary relay code as reported (`E` on, `e` off, `T` timed, `A` auto)
    pub aux_relay: char,
    /// Supply voltage in V
    pub voltage: Option<f64>,
    /// Rain detector probability in %
    pub rain_probability: Option<f64>,
    /// Cloud level in %
    pub cloud_level: Option<f64>,
    /// Absolute pressure in hPa
    pub absolute_pressure: Option<f64>,
    /// Calibrated (sea-level) pressure in hPa
    pub calibrated_pressure: Option<f64>,
    /// Pluviometer level in mm
    pub pluviometer_level: Option<f64>,
    /// Accumulated pluviometer counter in mm; an opaque device counter
    pub pluviometer_accumulated: Option<u32>,
    /// Pyranometer level in %
    pub pyranometer_level: Option<f64>,
    /// Photometer frequency in Hz
    pub photometer_frequency: Option<f64>,
    /// Ambient temperature in °C
    pub ambient_temperature: Option<f64>,
    /// Relative humidity in %
    pub humidity: Option<f64>,
    /// Dew point in °C
    pub dew_point: Option<f64>,
    /// Wind speed in km/h
    pub wind_speed: Option<f64>,
    /// 10-minute average wind speed in km/h
    pub wind_speed_average: Option<u32>,
    /// Wind orientation in degrees
    pub wind_direction: Option<u32>,
}

fn digits(input: &str) -> Result<u32, ()> {
    if !input.is_empty() && input.bytes().all(|b| b.is_ascii_digit()) {
        input.parse().map_err(|_| ())
    } else {
        Err(())
    }
}

fn sp(input: &str) -> IResult<&str, &str> {
    tag(" ")(input)
}

fn relay_code(input: &str) -> IResult<&str, char> {
    one_of("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz")(input)
}

fn unsigned(width: usize) -> impl Fn(&str) -> IResult<&str, u32> {
    move |input| map_res(take(width), digits)(input)
}

fn scaled(width: usize, divisor: f64) -> impl Fn(&str) -> IResult<&str, f64> {
    move |input| {
        let (rest, raw) = unsigned(width)(input)?;
        Ok((rest, f64::from(raw) / divisor))
    }
}

fn signed_scaled(width: usize, divisor: f64) -> impl Fn(&str) -> IResult<&str, f64> {
    move |input| {
        let (rest, sign) = one_of("+-")(input)?;
        let (rest, raw) = unsigned(width)(rest)?;
        let value = f64::from(raw) / divisor;
        Ok((rest, if sign == '-' { -value } else { value }))
    }
}

fn bounded(value: f64, min: f64, max: f64) -> Option<f64> {
    if value >= min && value <= max {
        Some(value)
    } else {
        None
    }
}

fn bulletin(input: &str) -> IResult<&str, Reading> {
    let (i, _) = tag("(")(input)?;
    let (i, roof_relay) = relay_code(i)?;
    let (i, _) = sp(i)?;
    let (i, aux_relay) = relay_code(i)?;
    let (i, _) = sp(i)?;
    let (i, voltage) = scaled(3, 10.0)(i)?;
    let (i, _) = sp(i)?;
    let (i, rain) = scaled(3, 10.0)(i)?;
    let (i, _) = sp(i)?;
    let (i, cloud) = scaled(3, 10.0)(i)?;
    let (i, _) = sp(i)?;
    let (i, abs_pressure) = scaled(5, 10.0)(i)?;
    let (i, _) = sp(i)?;
    let (i, cal_pressure) = scaled(5, 10.0)(i)?;
    let (i, _) = sp(i)?;
    let (i, pluviometer) = scaled(4, 10.0)(i)?;
    let (i, _) = sp(i)?;
    let (i, accumulated) = unsigned(3)(i)?;
    let (i, _) = sp(i)?;
    let (i, pyranometer) = scaled(3, 10.0)(i)?;
    let (i, _) = sp(i)?;
    let (i, photometer) = unsigned(5)(i)?;
    let (i, _) = sp(i)?;
    let (i, temperature) = signed_scaled(3, 10.0)(i)?;
    let (i, _) = sp(i)?;
    let (i, humidity) = scaled(3, 10.0)(i)?;
    let (i, _) = sp(i)?;
    let (i, dew_point) = signed_scaled(3, 10.0)(i)?;
    let (i, _) = sp(i)?;
    let (i, wind) = scaled(4, 10.0)(i)?;
    let (i, _) = sp(i)?;
    let (i, wind_average) = unsigned(3)(i)?;
    let (i, _) = sp(i)?;
    let (i, direction) = unsigned(3)(i)?;
    let (i, _) = tag(")")(i)?;

    Ok((
        i,
        Reading {
            roof_relay,
            aux_relay,
            voltage: bounded(voltage, 0.0, 25.5),
            rain_probability: bounded(rain, 0.0, 100.0),
            cloud_level: bounded(cloud, 0.0, 100.0),
            absolute_pressure: bounded(abs_pressure, 500.0, 1100.0),
            calibrated_pressure: bounded(cal_pressure, 500.0, 1100.0),
            pluviometer_level: bounded(pluviometer, 0.0, 500.0),
            pluviometer_accumulated: Some(accumulated),
            pyranometer_level: bounded(pyranometer, 0.0, 100.0),
            photometer_frequency: Some(f64::from(photometer)),
            ambient_temperature: bounded(temperature, -40.0, 85.0),
            humidity: bounded(humidity, 0.0, 100.0),
            dew_point: bounded(dew_point, -40.0, 85.0),
            wind_speed: bounded(wind, 0.0, 120.0),
            wind_speed_average: if wind_average <= 120 {
                Some(wind_average)
            } else {
                None
            },
            wind_direction: if direction <= 359 { Some(direction) } else { None },
        },
    ))
}

/// Try to decode a frame as a status bulletin
///
/// * `frame` - A complete frame, without its CR-LF terminator.
///
/// Returns `None` when the frame does not have the bulletin shape; this is
/// how command responses and garbage are told apart from the status stream.
pub fn decode(frame: &str) -> Option<Reading> {
    match bulletin(frame) {
        Ok((rest, reading)) if rest.is_empty() => Some(reading),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SAMPLE: &str =
        "(C E 118 000 125 10132 09987 0000 000 100 46000 +185 530 +093 0000 000 270)";

    #[test]
    fn decode_sample_bulletin() {
        let reading = decode(SAMPLE).expect("sample bulletin must decode");
        assert_eq!(reading.roof_relay, 'C');
        assert_eq!(reading.aux_relay, 'E');
        assert_eq!(reading.voltage, Some(11.8));
        assert_eq!(reading.rain_probability, Some(0.0));
        assert_eq!(reading.cloud_level, Some(12.5));
        assert_eq!(reading.absolute_pressure, Some(1013.2));
        assert_eq!(reading.calibrated_pressure, Some(998.7));
        assert_eq!(reading.pluviometer_level, Some(0.0));
        assert_eq!(reading.pluviometer_accumulated, Some(0));
        assert_eq!(reading.pyranometer_level, Some(10.0));
        assert_eq!(reading.photometer_frequency, Some(46000.0));
        assert_eq!(reading.ambient_temperature, Some(18.5));
        assert_eq!(reading.humidity, Some(53.0));
        assert_eq!(reading.dew_point, Some(9.3));
        assert_eq!(reading.wind_speed, Some(0.0));
        assert_eq!(reading.wind_speed_average, Some(0));
        assert_eq!(reading.wind_direction, Some(270));
    }

    #[test]
    fn out_of_range_field_is_missing_not_fatal() {
        // Pressure field reads 9999.9 hPa which is impossible; the rest of
        // the frame must still decode.
        let frame =
            "(C E 118 000 125 99999 09987 0000 000 100 46000 +185 530 +093 0000 000 270)";
        let reading = decode(frame).expect("frame shape is valid");
        assert_eq!(reading.absolute_pressure, None);
        assert_eq!(reading.calibrated_pressure, Some(998.7));
    }

    #[test]
    fn negative_temperatures() {
        let frame =
            "(C e 118 000 125 10132 09987 0000 000 100 46000 -052 530 -101 0000 000 270)";
        let reading = decode(frame).expect("frame shape is valid");
        assert_eq!(reading.ambient_temperature, Some(-5.2));
        assert_eq!(reading.dew_point, Some(-10.1));
    }

    #[test]
    fn command_responses_are_not_bulletins() {
        assert_eq!(decode("(X007)"), None);
        assert_eq!(decode("(S009)"), None);
        assert_eq!(decode("(Y 10:20:30 01/08/2026)"), None);
        assert_eq!(decode("(r)"), None);
    }

    #[test]
    fn malformed_widths_are_rejected() {
        // Voltage field one digit short.
        let frame =
            "(C E 18 000 125 10132 09987 0000 000 100 46000 +185 530 +093 0000 000 270)";
        assert_eq!(decode(frame), None);
        // Trailing garbage after the closing parenthesis.
        assert_eq!(decode(&format!("{}x", SAMPLE)), None);
    }

    fn build_frame(
        volt: u32,
        rain: u32,
        cloud: u32,
        abs: u32,
        cal: u32,
        temp: i32,
        hum: u32,
        wind: u32,
        ori: u32,
    ) -> String {
        format!(
            "(C E {:03} {:03} {:03} {:05} {:05} 0000 000 100 46000 {}{:03} {:03} +093 {:04} 000 {:03})",
            volt,
            rain,
            cloud,
            abs,
            cal,
            if temp < 0 { '-' } else { '+' },
            temp.abs(),
            hum,
            wind,
            ori
        )
    }

    proptest! {
        #[test]
        fn in_range_fields_round_trip(
            volt in 0u32..=255,
            rain in 0u32..=999,
            cloud in 0u32..=999,
            abs in 5000u32..=11000,
            cal in 5000u32..=11000,
            temp in -400i32..=850,
            hum in 0u32..=999,
            wind in 0u32..=1200,
            ori in 0u32..=359,
        ) {
            let frame = build_frame(volt, rain, cloud, abs, cal, temp, hum, wind, ori);
            let reading = decode(&frame).expect("generated frame must decode");
            prop_assert_eq!(reading.voltage, Some(f64::from(volt) / 10.0));
            prop_assert_eq!(reading.absolute_pressure, Some(f64::from(abs) / 10.0));
            prop_assert_eq!(reading.calibrated_pressure, Some(f64::from(cal) / 10.0));
            prop_assert_eq!(reading.ambient_temperature, Some(f64::from(temp) / 10.0));
            prop_assert_eq!(reading.wind_speed, Some(f64::from(wind) / 10.0));
            prop_assert_eq!(reading.wind_direction, Some(ori));
        }

        #[test]
        fn decode_never_panics(frame in ".{0,120}") {
            let _ = decode(&frame);
        }

        #[test]
        fn replay_is_idempotent(volt in 0u32..=255, wind in 0u32..=1200) {
            let frame = build_frame(volt, 0, 0, 10132, 10132, 185, 530, wind, 270);
            let first = decode(&frame);
            let second = decode(&frame);
            prop_assert_eq!(first, second);
        }
    }
}
