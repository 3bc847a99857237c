use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::calendar::{CalendarEngine, CalendarEntry};
use crate::protocol::{
    device_epoch, from_device_millis, AuxRelay, BooleanValueType, Descaling, EnumValue,
    Favorite, FunctionSupport, IntegerValueType, StateUpdate, UserMessage, UserSettings,
    MESSAGE_TYPE_NONE,
};
use crate::types::{DeviceId, FacilityType, ReadingSource, RunState, TemperatureUnit};

/// Canonical state snapshot of one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    /// Target temperature in device units
    pub target_temperature: i32,
    /// Standby offset temperature
    pub standby_offset_temperature: i32,
    /// External sensor temperature
    pub external_temperature: i32,
    /// Lowest selectable temperature
    pub lower_limit_temperature: i32,
    /// Highest selectable temperature
    pub upper_limit_temperature: i32,
    /// System lower temperature limit
    pub system_lower_limit_temperature: i32,
    /// System upper temperature limit
    pub system_upper_limit_temperature: i32,
    /// Bath time in minutes
    pub bath_time: i32,
    /// Bath time, whole hours
    pub bath_hours: i32,
    /// Bath time, remaining minutes
    pub bath_minutes: i32,
    /// Maximum bath time in minutes
    pub max_bath_time: i32,
    /// External sensor humidity
    pub external_humidity: i32,
    /// Target humidity
    pub target_humidity: i32,
    /// Steam tank water temperature
    pub tank_water_temperature: i32,
    /// Minutes left of the running bath
    pub run_time_left: i32,
    /// Minutes until a start is allowed
    pub time_to_allowed_start: i32,
    /// Steam tank standby temperature
    pub tank_standby_temperature: i32,
    /// Water level code
    pub water_level: u8,
    /// Region code
    pub region: u8,
    /// Facility type code
    pub facility_type: u8,
    /// Cabin lighting
    pub lighting: bool,
    /// Standby enabled
    pub standby_enable: bool,
    /// Humidity sensor present
    pub humidity_sensor_available: bool,
    /// Infrared elements enabled
    pub ir_enabled: bool,
    /// Delayed start enabled
    pub delayed_start_enable: bool,
    /// Delayed start counting down
    pub delayed_start_running: bool,
    /// Door magnetic sensor closed
    pub magnetic_sensor_connected: bool,
    /// Weekday programs disabled
    pub calendar_weekday_program_disable: bool,
    /// Temperature unit code
    pub temperature_unit: u8,
    /// Temperature source code
    pub temperature_presentation: u8,
    /// Humidity source code
    pub humidity_presentation: u8,
    /// Date format code
    pub date_format: u8,
    /// Time format code
    pub time_format: u8,
    /// First day of week code
    pub weekstart: u8,
    /// Language code
    pub language: u16,
    /// Favorite programs
    pub favorites: Vec<Favorite>,
    /// Auxiliary relays
    pub aux_relays: Vec<AuxRelay>,
    /// Active panel message
    pub user_message: Option<UserMessage>,
    /// Run state code, 0 before the first report
    pub run_state: u8,
    /// Device wall clock
    pub device_time: DateTime<Utc>,
    /// Descaling configuration
    pub descaling: Descaling,
    /// Temperature as presented on the panel
    pub presented_temperature: Option<i32>,
    /// Humidity as presented on the panel
    pub presented_humidity: Option<i32>,
    /// Board is the lite variant
    pub is_lite_variant: bool,
    /// Characters the panel can display
    pub supported_characters: Vec<char>,
    /// Max humidity per temperature step
    pub max_humidity_table: Vec<i32>,
    /// Max temperature table
    pub max_temperature_table: Vec<i32>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            target_temperature: 0,
            standby_offset_temperature: 0,
            external_temperature: 0,
            lower_limit_temperature: 0,
            upper_limit_temperature: 0,
            system_lower_limit_temperature: 0,
            system_upper_limit_temperature: 0,
            bath_time: 0,
            bath_hours: 1,
            bath_minutes: 30,
            max_bath_time: 0,
            external_humidity: 0,
            target_humidity: 0,
            tank_water_temperature: 0,
            run_time_left: 0,
            time_to_allowed_start: 0,
            tank_standby_temperature: 0,
            water_level: 0,
            region: 0,
            facility_type: 0,
            lighting: false,
            standby_enable: false,
            humidity_sensor_available: false,
            ir_enabled: false,
            delayed_start_enable: false,
            delayed_start_running: false,
            magnetic_sensor_connected: false,
            calendar_weekday_program_disable: false,
            temperature_unit: 10,
            temperature_presentation: 11,
            humidity_presentation: 11,
            date_format: 10,
            time_format: 10,
            weekstart: 10,
            language: 202,
            favorites: Vec::new(),
            aux_relays: Vec::new(),
            user_message: None,
            run_state: 0,
            device_time: device_epoch(),
            descaling: Descaling::default(),
            presented_temperature: None,
            presented_humidity: None,
            is_lite_variant: false,
            supported_characters: Vec::new(),
            max_humidity_table: Vec::new(),
            max_temperature_table: Vec::new(),
        }
    }
}

impl DeviceState {
    /// Authoritative temperature source
    #[must_use]
    pub fn temperature_source(&self) -> ReadingSource {
        ReadingSource::from(self.temperature_presentation)
    }

    /// Authoritative humidity source
    #[must_use]
    pub fn humidity_source(&self) -> ReadingSource {
        ReadingSource::from(self.humidity_presentation)
    }

    /// Temperature unit shown on the panel
    #[must_use]
    pub fn unit(&self) -> TemperatureUnit {
        TemperatureUnit::from(self.temperature_unit)
    }

    /// Facility classification
    #[must_use]
    pub fn facility(&self) -> FacilityType {
        FacilityType::from(self.facility_type)
    }

    /// Highest humidity allowed at the current target temperature
    #[must_use]
    pub fn max_humidity_for_target(&self) -> Option<i32> {
        let step = usize::try_from(self.target_temperature / 9).ok()?;
        self.max_humidity_table.get(step).copied()
    }

    /// Look up a favorite by its carried index
    #[must_use]
    pub fn favorite(&self, index: u8) -> Option<&Favorite> {
        self.favorites.iter().find(|f| f.index == index)
    }
}

/// Change emitted by the state model, in processing order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    /// Discovery payload should be refreshed
    DiscoveryRequested,
    /// Target temperature changed
    TargetTemperature(i32),
    /// Standby offset changed
    StandbyOffsetTemperature(i32),
    /// Authoritative cabin temperature changed
    Temperature(i32),
    /// Bath time changed
    BathTime(i32),
    /// Authoritative cabin humidity changed
    Humidity(i32),
    /// Target humidity changed
    TargetHumidity(i32),
    /// Tank water temperature changed
    TankWaterTemperature(i32),
    /// Run time left changed
    RunTimeLeft(i32),
    /// Tank standby temperature changed
    TankStandbyTemperature(i32),
    /// Water level code changed
    WaterLevel(u8),
    /// Lighting switched
    Light(bool),
    /// Door sensor changed
    Door {
        /// Door is open
        open: bool,
    },
    /// Run state changed
    RunState {
        /// New state
        state: RunState,
        /// Device clock at the time of the report
        device_time: DateTime<Utc>,
    },
    /// A panel message became active
    ErrorRaised(UserMessage),
    /// The panel message was cleared
    ErrorCleared,
}

fn set_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

/// Per-device state snapshots
#[derive(Debug, Default)]
pub struct StateModel {
    states: HashMap<DeviceId, DeviceState>,
}

impl StateModel {
    /// Create an empty model
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a device, created with defaults on first access
    pub fn state(&mut self, device_id: DeviceId) -> &DeviceState {
        self.states.entry(device_id).or_default()
    }

    /// Mutable snapshot of a device, created with defaults on first access
    pub fn state_mut(&mut self, device_id: DeviceId) -> &mut DeviceState {
        self.states.entry(device_id).or_default()
    }

    /// Snapshot of a device if one exists
    #[must_use]
    pub fn get(&self, device_id: DeviceId) -> Option<&DeviceState> {
        self.states.get(&device_id)
    }

    /// Restore the defaults of a device
    pub fn reset(&mut self, device_id: DeviceId) {
        debug!("Resetting state of device {}", device_id);
        self.states.insert(device_id, DeviceState::default());
    }

    /// Apply a decoded state update and return the resulting changes
    pub fn apply(
        &mut self,
        device_id: DeviceId,
        update: &StateUpdate,
        calendar: &mut CalendarEngine,
    ) -> Vec<StateEvent> {
        let state = self.states.entry(device_id).or_default();
        let mut events = Vec::new();

        apply_integers(state, update, &mut events);
        apply_enums(state, &update.enum_values, &mut events);
        apply_booleans(state, update, &mut events);
        if let Some(settings) = &update.user_settings {
            apply_user_settings(state, settings, &mut events);
        }
        if !update.favorites.is_empty() {
            merge_by_index(&mut state.favorites, &update.favorites, |f| f.index);
        }
        if let Some(report) = &update.run_state {
            if let Some(time) = report.device_time {
                match from_device_millis(time) {
                    Some(instant) => state.device_time = instant,
                    None => warn!("Ignoring out of range device time {} from {}", time, device_id),
                }
            }
            if let Some(code) = report.state {
                if set_if_changed(&mut state.run_state, code) {
                    events.push(StateEvent::RunState {
                        state: RunState::from(code),
                        device_time: state.device_time,
                    });
                }
            }
        }
        if let Some(message) = &update.user_message {
            apply_user_message(state, message, &mut events);
        }
        if !update.aux_relays.is_empty() {
            merge_by_index(&mut state.aux_relays, &update.aux_relays, |a| a.index);
        }
        if let Some(descaling) = update.descaling {
            state.descaling = descaling;
        }
        for program in &update.calendar_programs {
            match CalendarEntry::from_program(program) {
                Some(entry) => calendar.store_entry(device_id, entry),
                None => warn!(
                    "Ignoring calendar program {} from {} with an out of range time",
                    program.index, device_id
                ),
            }
        }
        if let Some(presented) = &update.presented_value {
            if let Some(temperature) = presented.temperature {
                if set_if_changed(&mut state.presented_temperature, Some(temperature))
                    && state.temperature_source() == ReadingSource::PresentedValue
                {
                    events.push(StateEvent::Temperature(temperature));
                }
            }
            if let Some(humidity) = presented.humidity {
                if set_if_changed(&mut state.presented_humidity, Some(humidity))
                    && state.humidity_source() == ReadingSource::PresentedValue
                {
                    events.push(StateEvent::Humidity(humidity));
                }
            }
        }
        if let Some(board) = update.control_board {
            state.is_lite_variant = board.is_lite_variant;
        }
        if let Some(support) = &update.function_support {
            apply_function_support(state, support);
        }

        events
    }
}

fn apply_integers(state: &mut DeviceState, update: &StateUpdate, events: &mut Vec<StateEvent>) {
    for value in &update.integer_values {
        let Some(kind) = IntegerValueType::from_u8(value.value_type) else {
            continue;
        };
        let v = value.value;
        match kind {
            IntegerValueType::TargetTemperature => {
                if set_if_changed(&mut state.target_temperature, v) {
                    events.push(StateEvent::DiscoveryRequested);
                    events.push(StateEvent::TargetTemperature(v));
                }
            }
            IntegerValueType::StandbyOffsetTemperature => {
                if set_if_changed(&mut state.standby_offset_temperature, v) {
                    events.push(StateEvent::StandbyOffsetTemperature(v));
                }
            }
            IntegerValueType::ExternalTemperature => {
                if set_if_changed(&mut state.external_temperature, v)
                    && state.temperature_source() == ReadingSource::ExternalSensor
                {
                    events.push(StateEvent::Temperature(v));
                }
            }
            IntegerValueType::LowerLimitTemperature => state.lower_limit_temperature = v,
            IntegerValueType::UpperLimitTemperature => state.upper_limit_temperature = v,
            IntegerValueType::SystemLowerLimitTemperature => {
                state.system_lower_limit_temperature = v;
            }
            IntegerValueType::SystemUpperLimitTemperature => {
                state.system_upper_limit_temperature = v;
            }
            IntegerValueType::BathTime => {
                if set_if_changed(&mut state.bath_time, v) {
                    state.bath_hours = v / 60;
                    state.bath_minutes = v % 60;
                    events.push(StateEvent::BathTime(v));
                }
            }
            IntegerValueType::MaxBathTime => state.max_bath_time = v,
            IntegerValueType::ExternalHumidity => {
                if set_if_changed(&mut state.external_humidity, v)
                    && state.humidity_source() == ReadingSource::ExternalSensor
                {
                    events.push(StateEvent::Humidity(v));
                }
            }
            IntegerValueType::TargetHumidity => {
                if set_if_changed(&mut state.target_humidity, v) {
                    events.push(StateEvent::TargetHumidity(v));
                }
            }
            IntegerValueType::TankWaterTemperature => {
                if set_if_changed(&mut state.tank_water_temperature, v) {
                    events.push(StateEvent::TankWaterTemperature(v));
                }
            }
            IntegerValueType::RunTimeLeft => {
                if set_if_changed(&mut state.run_time_left, v) {
                    events.push(StateEvent::RunTimeLeft(v));
                }
            }
            IntegerValueType::TimeToAllowedStart => state.time_to_allowed_start = v,
            IntegerValueType::TankStandbyTemperature => {
                if set_if_changed(&mut state.tank_standby_temperature, v) {
                    events.push(StateEvent::TankStandbyTemperature(v));
                }
            }
            IntegerValueType::StartFavorite => {}
        }
    }
}

fn apply_enums(state: &mut DeviceState, values: &[EnumValue], events: &mut Vec<StateEvent>) {
    for value in values {
        match *value {
            EnumValue::WaterLevel(level) if level != 0 => {
                if set_if_changed(&mut state.water_level, level) {
                    events.push(StateEvent::WaterLevel(level));
                }
            }
            EnumValue::Region(region) if region != 0 => state.region = region,
            EnumValue::FacilityType(facility) if facility != 0 => state.facility_type = facility,
            _ => {}
        }
    }
}

fn apply_booleans(state: &mut DeviceState, update: &StateUpdate, events: &mut Vec<StateEvent>) {
    for value in &update.boolean_values {
        let Some(kind) = BooleanValueType::from_u8(value.value_type) else {
            continue;
        };
        let v = value.value;
        match kind {
            BooleanValueType::Lighting => {
                if set_if_changed(&mut state.lighting, v) {
                    events.push(StateEvent::Light(v));
                }
            }
            BooleanValueType::StandbyEnable => state.standby_enable = v,
            BooleanValueType::HumiditySensorAvailable => state.humidity_sensor_available = v,
            BooleanValueType::DelayedStartEnable => state.delayed_start_enable = v,
            BooleanValueType::DelayedStartRunning => state.delayed_start_running = v,
            BooleanValueType::MagneticSensorConnected => {
                // a closed magnetic contact means the door is shut
                if set_if_changed(&mut state.magnetic_sensor_connected, v) {
                    events.push(StateEvent::Door { open: !v });
                }
            }
            BooleanValueType::CalendarWeekdayProgramDisable => {
                state.calendar_weekday_program_disable = v;
            }
            BooleanValueType::IrEnabled => state.ir_enabled = v,
        }
    }
}

fn apply_user_settings(
    state: &mut DeviceState,
    settings: &UserSettings,
    events: &mut Vec<StateEvent>,
) {
    if let Some(unit) = settings.temperature_unit {
        if set_if_changed(&mut state.temperature_unit, unit) {
            events.push(StateEvent::DiscoveryRequested);
        }
    }
    if let Some(v) = settings.temperature_presentation {
        state.temperature_presentation = v;
    }
    if let Some(v) = settings.humidity_presentation {
        state.humidity_presentation = v;
    }
    if let Some(v) = settings.date_format {
        state.date_format = v;
    }
    if let Some(v) = settings.time_format {
        state.time_format = v;
    }
    if let Some(v) = settings.weekstart {
        state.weekstart = v;
    }
    if let Some(v) = settings.language {
        state.language = v;
    }
}

fn apply_user_message(state: &mut DeviceState, message: &UserMessage, events: &mut Vec<StateEvent>) {
    if message.message_type == MESSAGE_TYPE_NONE {
        // The bus may still hold a message raised before a reconnect reset
        state.user_message = None;
        events.push(StateEvent::ErrorCleared);
    } else if state.user_message.as_ref() != Some(message) {
        state.user_message = Some(message.clone());
        events.push(StateEvent::ErrorRaised(message.clone()));
    }
}

fn apply_function_support(state: &mut DeviceState, support: &FunctionSupport) {
    if state.supported_characters.is_empty() && !support.supported_characters.is_empty() {
        state.supported_characters = char::decode_utf16(support.supported_characters.iter().copied())
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
    }
    if state.max_humidity_table.is_empty() {
        state.max_humidity_table.clone_from(&support.max_humidity);
    }
    if state.max_temperature_table.is_empty() {
        state.max_temperature_table.clone_from(&support.max_temperature);
    }
}

/// First nonempty list replaces, later lists overwrite by carried index
fn merge_by_index<T: Clone>(list: &mut Vec<T>, incoming: &[T], index_of: impl Fn(&T) -> u8) {
    if list.is_empty() {
        *list = incoming.to_vec();
        return;
    }
    for item in incoming {
        let index = index_of(item);
        match list.iter_mut().find(|existing| index_of(existing) == index) {
            Some(existing) => *existing = item.clone(),
            None => list.push(item.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        BooleanValue, CalendarProgram, IntegerValue, PresentedValue, RunStateReport,
        ANSWER_PENDING, FAVORITE_NONE, MESSAGE_TYPE_ERROR,
    };
    use chrono::FixedOffset;

    const ID: DeviceId = DeviceId(7);

    fn engine() -> CalendarEngine {
        CalendarEngine::new(FixedOffset::east_opt(0).unwrap())
    }

    fn integers(values: &[(IntegerValueType, i32)]) -> StateUpdate {
        StateUpdate {
            integer_values: values
                .iter()
                .map(|(t, v)| IntegerValue::new(*t, *v))
                .collect(),
            ..StateUpdate::default()
        }
    }

    #[test]
    fn test_defaults() {
        let state = DeviceState::default();
        assert_eq!(state.temperature_unit, 10);
        assert_eq!(state.temperature_source(), ReadingSource::ExternalSensor);
        assert_eq!(state.language, 202);
        assert_eq!((state.bath_hours, state.bath_minutes), (1, 30));
        assert_eq!(state.device_time, device_epoch());
    }

    #[test]
    fn test_redundant_updates_do_not_reemit() {
        let mut model = StateModel::new();
        let mut calendar = engine();
        let update = integers(&[(IntegerValueType::TargetHumidity, 40)]);

        let first = model.apply(ID, &update, &mut calendar);
        assert_eq!(first, vec![StateEvent::TargetHumidity(40)]);
        let second = model.apply(ID, &update, &mut calendar);
        assert!(second.is_empty());
    }

    #[test]
    fn test_target_temperature_requests_discovery_first() {
        let mut model = StateModel::new();
        let events = model.apply(
            ID,
            &integers(&[(IntegerValueType::TargetTemperature, 720)]),
            &mut engine(),
        );
        assert_eq!(
            events,
            vec![StateEvent::DiscoveryRequested, StateEvent::TargetTemperature(720)]
        );
    }

    #[test]
    fn test_temperature_source_gating() {
        let mut model = StateModel::new();
        let mut calendar = engine();

        let events = model.apply(
            ID,
            &StateUpdate {
                integer_values: vec![IntegerValue::new(IntegerValueType::ExternalTemperature, 600)],
                presented_value: Some(PresentedValue {
                    temperature: Some(610),
                    humidity: None,
                }),
                ..StateUpdate::default()
            },
            &mut calendar,
        );
        assert_eq!(events, vec![StateEvent::Temperature(600)]);

        model.state_mut(ID).temperature_presentation = 10;
        let events = model.apply(
            ID,
            &StateUpdate {
                integer_values: vec![IntegerValue::new(IntegerValueType::ExternalTemperature, 605)],
                presented_value: Some(PresentedValue {
                    temperature: Some(615),
                    humidity: None,
                }),
                ..StateUpdate::default()
            },
            &mut calendar,
        );
        assert_eq!(events, vec![StateEvent::Temperature(615)]);
        assert_eq!(model.state(ID).external_temperature, 605);
    }

    #[test]
    fn test_bath_time_split() {
        let mut model = StateModel::new();
        model.apply(ID, &integers(&[(IntegerValueType::BathTime, 135)]), &mut engine());
        let state = model.state(ID);
        assert_eq!((state.bath_hours, state.bath_minutes), (2, 15));
    }

    #[test]
    fn test_door_from_magnetic_sensor() {
        let mut model = StateModel::new();
        let update = StateUpdate {
            boolean_values: vec![BooleanValue {
                value_type: BooleanValueType::MagneticSensorConnected as u8,
                value: true,
            }],
            ..StateUpdate::default()
        };
        let events = model.apply(ID, &update, &mut engine());
        assert_eq!(events, vec![StateEvent::Door { open: false }]);
    }

    #[test]
    fn test_user_message_raise_and_clear() {
        let mut model = StateModel::new();
        let mut calendar = engine();
        let message = UserMessage {
            message_type: MESSAGE_TYPE_ERROR,
            identity: 20,
            answer: ANSWER_PENDING,
            text: "Door open".to_string(),
        };
        let raise = StateUpdate {
            user_message: Some(message.clone()),
            ..StateUpdate::default()
        };
        assert_eq!(
            model.apply(ID, &raise, &mut calendar),
            vec![StateEvent::ErrorRaised(message)]
        );
        assert!(model.apply(ID, &raise, &mut calendar).is_empty());

        let clear = StateUpdate {
            user_message: Some(UserMessage {
                message_type: MESSAGE_TYPE_NONE,
                identity: 0,
                answer: 0,
                text: String::new(),
            }),
            ..StateUpdate::default()
        };
        assert_eq!(model.apply(ID, &clear, &mut calendar), vec![StateEvent::ErrorCleared]);
        assert!(model.state(ID).user_message.is_none());
    }

    #[test]
    fn test_clear_after_reset_still_reported() {
        let mut model = StateModel::new();
        let mut calendar = engine();
        model.apply(
            ID,
            &StateUpdate {
                user_message: Some(UserMessage {
                    message_type: MESSAGE_TYPE_ERROR,
                    identity: 20,
                    answer: ANSWER_PENDING,
                    text: "Door open".to_string(),
                }),
                ..StateUpdate::default()
            },
            &mut calendar,
        );
        model.reset(ID);

        let clear = StateUpdate {
            user_message: Some(UserMessage {
                message_type: MESSAGE_TYPE_NONE,
                identity: 0,
                answer: 0,
                text: String::new(),
            }),
            ..StateUpdate::default()
        };
        assert_eq!(model.apply(ID, &clear, &mut calendar), vec![StateEvent::ErrorCleared]);
        assert_eq!(model.apply(ID, &clear, &mut calendar), vec![StateEvent::ErrorCleared]);
    }

    #[test]
    fn test_run_state_carries_device_time() {
        let mut model = StateModel::new();
        let update = StateUpdate {
            run_state: Some(RunStateReport {
                state: Some(11),
                device_time: Some(3_600_000),
            }),
            ..StateUpdate::default()
        };
        let events = model.apply(ID, &update, &mut engine());
        assert_eq!(
            events,
            vec![StateEvent::RunState {
                state: RunState::On,
                device_time: from_device_millis(3_600_000).unwrap(),
            }]
        );
    }

    #[test]
    fn test_out_of_range_times_leave_state_untouched() {
        let mut model = StateModel::new();
        let mut calendar = engine();
        let update = StateUpdate {
            run_state: Some(RunStateReport {
                state: None,
                device_time: Some(i64::MAX),
            }),
            calendar_programs: vec![CalendarProgram {
                index: 4,
                valid: true,
                activation_time: Some(i64::MAX / 2),
                bath_time: 60,
                temperature_set_point: 800,
                humidity_set_point: 0,
                weekday: false,
                start_mode: 1,
                standby: false,
                favorite: FAVORITE_NONE,
            }],
            ..StateUpdate::default()
        };
        assert!(model.apply(ID, &update, &mut calendar).is_empty());
        assert_eq!(model.state(ID).device_time, device_epoch());
        assert!(calendar.entry(ID, 4).is_none());
    }

    #[test]
    fn test_favorites_replace_then_patch() {
        let mut model = StateModel::new();
        let mut calendar = engine();
        let favorite = |index: u8, bath_time: u16| Favorite {
            index,
            name: format!("F{index}"),
            bath_time,
            temperature_set_point: 700,
            humidity_set_point: 0,
        };
        let first = StateUpdate {
            favorites: vec![favorite(0, 60), favorite(1, 90)],
            ..StateUpdate::default()
        };
        model.apply(ID, &first, &mut calendar);
        let patch = StateUpdate {
            favorites: vec![favorite(1, 45)],
            ..StateUpdate::default()
        };
        model.apply(ID, &patch, &mut calendar);

        let state = model.state(ID);
        assert_eq!(state.favorites.len(), 2);
        assert_eq!(state.favorite(1).map(|f| f.bath_time), Some(45));
    }

    #[test]
    fn test_capability_tables_populate_once() {
        let mut model = StateModel::new();
        let mut calendar = engine();
        let support = |value: i32| StateUpdate {
            function_support: Some(FunctionSupport {
                supported_characters: vec![u16::from(b'A')],
                max_humidity: vec![value; 3],
                max_temperature: vec![value],
            }),
            ..StateUpdate::default()
        };
        model.apply(ID, &support(60), &mut calendar);
        model.apply(ID, &support(80), &mut calendar);
        let state = model.state(ID);
        assert_eq!(state.max_humidity_table, vec![60; 3]);
        assert_eq!(state.supported_characters, vec!['A']);
    }

    #[test]
    fn test_calendar_programs_are_forwarded() {
        let mut model = StateModel::new();
        let mut calendar = engine();
        let update = StateUpdate {
            calendar_programs: vec![CalendarProgram {
                index: 4,
                valid: true,
                activation_time: Some(0),
                bath_time: 60,
                temperature_set_point: 700,
                humidity_set_point: 0,
                weekday: false,
                start_mode: 2,
                standby: false,
                favorite: FAVORITE_NONE,
            }],
            ..StateUpdate::default()
        };
        model.apply(ID, &update, &mut calendar);
        assert!(calendar.entry(ID, 4).is_some());
    }
}
