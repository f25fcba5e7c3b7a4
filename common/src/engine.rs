use thiserror::Error;

use crate::{
    actuator::{ActuatorDriver, ActuatorError, MAX_BRIGHTNESS},
    config::{MotionConfig, RuntimeConfig},
    flaps::{Flap, FlapError, FlapLimits, FlapSet},
    types::{Axis, CalibratorState, CoverState, FlapMovement},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    CoverStateChanged { from: CoverState, to: CoverState },
    CalibratorStateChanged { from: CalibratorState, to: CalibratorState },
    ActuatorFault { axis: Axis, error: ActuatorError },
    WatchdogTripped { ticks: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("{} is not present", .0.as_str())]
    NotPresent(Axis),
    #[error("{} is in error state", .0.as_str())]
    Faulted(Axis),
    #[error("cover is moving")]
    CoverMoving,
    #[error(transparent)]
    Flap(#[from] FlapError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MotionPhase {
    PowerUp { remaining: u32 },
    Stepping,
    Settling { remaining: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Motion {
    target: CoverState,
    phase: MotionPhase,
    elapsed_ticks: u32,
}

/// Cover and calibrator state machine. Requests only set targets; `tick`
/// converges actual state toward them and is the sole writer of outputs.
#[derive(Debug, Clone)]
pub struct CoverCalibratorEngine {
    config: MotionConfig,
    flaps: FlapSet,
    servo_channels: usize,

    cover_state: CoverState,
    target_cover_state: CoverState,
    motion: Option<Motion>,
    resync_flaps: bool,
    servo_power: bool,

    calibrator_state: CalibratorState,
    target_calibrator_state: CalibratorState,
    brightness: u16,
    brightness_changed: bool,
    stabilize_remaining: u32,
}

impl CoverCalibratorEngine {
    pub fn new(config: &RuntimeConfig) -> Self {
        let cover_state = if config.hardware.cover_present {
            CoverState::Closed
        } else {
            CoverState::NotPresent
        };
        let calibrator_state = if config.hardware.calibrator_present {
            CalibratorState::Off
        } else {
            CalibratorState::NotPresent
        };

        Self {
            config: config.motion.clone(),
            flaps: FlapSet::from_limits(&config.settings.flaps),
            servo_channels: config.hardware.topology.channel_count(),
            cover_state,
            target_cover_state: cover_state,
            motion: None,
            resync_flaps: false,
            servo_power: false,
            calibrator_state,
            target_calibrator_state: calibrator_state,
            brightness: config.settings.brightness.min(MAX_BRIGHTNESS),
            brightness_changed: false,
            stabilize_remaining: 0,
        }
    }

    pub fn motion_config(&self) -> &MotionConfig {
        &self.config
    }

    pub fn movement(&self) -> FlapMovement {
        self.config.movement
    }

    pub fn flaps(&self) -> &FlapSet {
        &self.flaps
    }

    pub fn servo_channels(&self) -> usize {
        self.servo_channels
    }

    pub fn cover_state(&self) -> CoverState {
        self.cover_state
    }

    pub fn target_cover_state(&self) -> CoverState {
        self.target_cover_state
    }

    pub fn calibrator_state(&self) -> CalibratorState {
        self.calibrator_state
    }

    pub fn target_calibrator_state(&self) -> CalibratorState {
        self.target_calibrator_state
    }

    pub fn brightness(&self) -> u16 {
        self.brightness
    }

    pub fn servo_power(&self) -> bool {
        self.servo_power
    }

    pub fn is_moving(&self) -> bool {
        matches!(self.cover_state, CoverState::Moving | CoverState::Halted)
    }

    pub fn open_cover(&mut self) -> Result<(), RequestError> {
        self.cover_available()?;
        self.target_cover_state = CoverState::Open;
        Ok(())
    }

    pub fn close_cover(&mut self) -> Result<(), RequestError> {
        self.cover_available()?;
        self.target_cover_state = CoverState::Closed;
        Ok(())
    }

    /// Only meaningful while moving; otherwise the target collapses back onto
    /// the current state.
    pub fn halt_cover(&mut self) -> Result<(), RequestError> {
        self.cover_available()?;
        self.target_cover_state = match self.cover_state {
            CoverState::Moving | CoverState::Halted => CoverState::Halted,
            current => current,
        };
        Ok(())
    }

    pub fn calibrator_on(&mut self, brightness: u16) -> Result<(), RequestError> {
        self.calibrator_available()?;
        if matches!(
            self.calibrator_state,
            CalibratorState::Ready | CalibratorState::NotReady
        ) {
            self.brightness_changed = true;
        }
        self.brightness = brightness.min(MAX_BRIGHTNESS);
        self.target_calibrator_state = CalibratorState::Ready;
        Ok(())
    }

    pub fn calibrator_off(&mut self) -> Result<(), RequestError> {
        self.calibrator_available()?;
        self.brightness_changed = false;
        self.target_calibrator_state = CalibratorState::Off;
        Ok(())
    }

    /// Setup path for brightness. Clears a calibrator fault.
    pub fn configure_calibrator(&mut self, brightness: u16, on: bool) -> Result<(), RequestError> {
        if self.calibrator_state == CalibratorState::NotPresent {
            return Err(RequestError::NotPresent(Axis::Calibrator));
        }
        if self.calibrator_state == CalibratorState::Error {
            self.calibrator_state = CalibratorState::Off;
            self.target_calibrator_state = CalibratorState::Off;
        }
        if on {
            self.calibrator_on(brightness)
        } else {
            self.brightness = brightness.min(MAX_BRIGHTNESS);
            self.calibrator_off()
        }
    }

    pub fn set_flap_count(&mut self, count: usize) -> Result<(), RequestError> {
        self.cover_reconfigurable()?;
        self.flaps.resize(count, self.servo_channels)?;
        self.after_flap_reconfiguration();
        Ok(())
    }

    pub fn set_flap_limits(&mut self, index: usize, limits: FlapLimits) -> Result<(), RequestError> {
        self.cover_reconfigurable()?;
        self.flaps.set_limits(index, limits)?;
        self.after_flap_reconfiguration();
        Ok(())
    }

    /// Writes the current model to every output once. Used at boot.
    pub fn sync_outputs(&mut self, driver: &mut dyn ActuatorDriver) -> Vec<EngineEvent> {
        let mut events = Vec::new();

        if self.cover_state != CoverState::NotPresent {
            let result = driver
                .set_power(false)
                .and_then(|()| self.write_all_positions(driver));
            self.servo_power = false;
            if let Err(error) = result {
                self.cover_fault(driver, error, &mut events);
            }
        }

        if self.calibrator_state != CalibratorState::NotPresent {
            let value = match self.calibrator_state {
                CalibratorState::Ready | CalibratorState::NotReady => self.brightness,
                _ => 0,
            };
            if let Err(error) = driver.set_illuminator(value) {
                self.calibrator_fault(error, &mut events);
            }
        }

        events
    }

    pub fn tick(&mut self, driver: &mut dyn ActuatorDriver) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        self.tick_cover(driver, &mut events);
        self.tick_calibrator(driver, &mut events);
        events
    }

    fn tick_cover(&mut self, driver: &mut dyn ActuatorDriver, events: &mut Vec<EngineEvent>) {
        match self.cover_state {
            CoverState::NotPresent | CoverState::Error => {}
            CoverState::Halted => {
                self.motion = None;
                if let Err(error) = self.set_servo_power(driver, false) {
                    self.cover_fault(driver, error, events);
                    return;
                }
                if self.target_cover_state == CoverState::Halted {
                    self.target_cover_state = CoverState::Unknown;
                }
                self.set_cover_state(CoverState::Unknown, events);
            }
            CoverState::Moving => {
                if self.halt_pending() {
                    self.set_cover_state(CoverState::Halted, events);
                } else {
                    self.advance_motion(driver, events);
                }
            }
            CoverState::Closed | CoverState::Open | CoverState::Unknown => {
                if self.resync_flaps {
                    self.resync_flaps = false;
                    if let Err(error) = self.write_all_positions(driver) {
                        self.cover_fault(driver, error, events);
                        return;
                    }
                }
                let target = self.target_cover_state;
                if matches!(target, CoverState::Open | CoverState::Closed) && target != self.cover_state {
                    self.start_motion(target, driver, events);
                }
            }
        }
    }

    fn start_motion(
        &mut self,
        target: CoverState,
        driver: &mut dyn ActuatorDriver,
        events: &mut Vec<EngineEvent>,
    ) {
        if let Err(error) = self.set_servo_power(driver, true) {
            self.cover_fault(driver, error, events);
            return;
        }
        self.motion = Some(Motion {
            target,
            phase: MotionPhase::PowerUp {
                remaining: self.config.servo_start_ticks.max(1),
            },
            elapsed_ticks: 0,
        });
        self.set_cover_state(CoverState::Moving, events);
    }

    fn advance_motion(&mut self, driver: &mut dyn ActuatorDriver, events: &mut Vec<EngineEvent>) {
        let Some(mut motion) = self.motion.take() else {
            // Moving without a motion record cannot converge.
            self.set_cover_state(CoverState::Unknown, events);
            self.target_cover_state = CoverState::Unknown;
            return;
        };

        motion.elapsed_ticks = motion.elapsed_ticks.saturating_add(1);
        if motion.elapsed_ticks > self.config.max_motion_ticks {
            events.push(EngineEvent::WatchdogTripped {
                ticks: motion.elapsed_ticks,
            });
            if let Err(error) = self.set_servo_power(driver, false) {
                events.push(EngineEvent::ActuatorFault {
                    axis: Axis::Cover,
                    error,
                });
            }
            self.set_cover_state(CoverState::Error, events);
            self.target_cover_state = CoverState::Error;
            return;
        }

        let target = self.target_cover_state;
        if matches!(target, CoverState::Open | CoverState::Closed) && target != motion.target {
            motion.target = target;
            if matches!(motion.phase, MotionPhase::Settling { .. }) {
                motion.phase = MotionPhase::Stepping;
            }
        }

        match motion.phase {
            MotionPhase::PowerUp { remaining } => {
                motion.phase = if remaining <= 1 {
                    MotionPhase::Stepping
                } else {
                    MotionPhase::PowerUp {
                        remaining: remaining - 1,
                    }
                };
                self.motion = Some(motion);
            }
            MotionPhase::Stepping => match self.step_flaps(motion.target, driver) {
                Err(error) => self.cover_fault(driver, error, events),
                Ok(false) => self.motion = Some(motion),
                Ok(true) if self.config.movement == FlapMovement::AllFlapsAtOnce => {
                    motion.phase = MotionPhase::Settling {
                        remaining: self.config.all_flaps_settle_ticks.max(1),
                    };
                    self.motion = Some(motion);
                }
                Ok(true) => self.finish_motion(motion.target, driver, events),
            },
            MotionPhase::Settling { remaining } => {
                if remaining <= 1 {
                    self.finish_motion(motion.target, driver, events);
                } else {
                    motion.phase = MotionPhase::Settling {
                        remaining: remaining - 1,
                    };
                    self.motion = Some(motion);
                }
            }
        }
    }

    /// Performs this tick's servo writes. Returns whether every flap sits at
    /// its goal afterwards.
    fn step_flaps(
        &mut self,
        target: CoverState,
        driver: &mut dyn ActuatorDriver,
    ) -> Result<bool, ActuatorError> {
        let increment = self.config.position_increment_deg;

        match self.config.movement {
            FlapMovement::EachFlapInSequence => {
                let next = (0..self.flaps.len()).find(|&index| {
                    self.flaps
                        .get(index)
                        .is_some_and(|flap| flap.position() != goal_for(flap, target))
                });
                if let Some(index) = next {
                    self.step_flap(index, target, increment, driver)?;
                }
            }
            FlapMovement::EachFlapIncremental => {
                for index in 0..self.flaps.len() {
                    self.step_flap(index, target, increment, driver)?;
                }
            }
            FlapMovement::AllFlapsAtOnce => {
                for index in 0..self.flaps.len() {
                    self.step_flap(index, target, u8::MAX, driver)?;
                }
            }
        }

        Ok(self.flaps.all_at(|flap| goal_for(flap, target)))
    }

    fn step_flap(
        &mut self,
        index: usize,
        target: CoverState,
        increment: u8,
        driver: &mut dyn ActuatorDriver,
    ) -> Result<(), ActuatorError> {
        if self.halt_pending() {
            return Ok(());
        }
        let Some(flap) = self.flaps.get_mut(index) else {
            return Ok(());
        };
        let goal = goal_for(flap, target);
        if flap.position() == goal {
            return Ok(());
        }
        let next = flap.step_toward(goal, increment);
        driver.set_flap_position(index, next)?;
        flap.set_position(next);
        Ok(())
    }

    fn finish_motion(
        &mut self,
        target: CoverState,
        driver: &mut dyn ActuatorDriver,
        events: &mut Vec<EngineEvent>,
    ) {
        self.motion = None;
        if let Err(error) = self.set_servo_power(driver, false) {
            self.cover_fault(driver, error, events);
            return;
        }
        self.set_cover_state(target, events);
    }

    fn tick_calibrator(&mut self, driver: &mut dyn ActuatorDriver, events: &mut Vec<EngineEvent>) {
        if matches!(
            self.calibrator_state,
            CalibratorState::NotPresent | CalibratorState::Error
        ) {
            return;
        }

        match (self.target_calibrator_state, self.calibrator_state) {
            (CalibratorState::Off, CalibratorState::Off) => {}
            (CalibratorState::Off, _) => {
                self.brightness_changed = false;
                match driver.set_illuminator(0) {
                    Ok(()) => self.set_calibrator_state(CalibratorState::Off, events),
                    Err(error) => self.calibrator_fault(error, events),
                }
            }
            (CalibratorState::Ready, CalibratorState::Off | CalibratorState::Unknown) => {
                self.apply_brightness(driver, events);
            }
            (CalibratorState::Ready, CalibratorState::NotReady) => {
                if self.brightness_changed {
                    self.apply_brightness(driver, events);
                } else if self.stabilize_remaining <= 1 {
                    self.stabilize_remaining = 0;
                    self.set_calibrator_state(CalibratorState::Ready, events);
                } else {
                    self.stabilize_remaining -= 1;
                }
            }
            (CalibratorState::Ready, CalibratorState::Ready) => {
                if self.brightness_changed {
                    self.brightness_changed = false;
                    if let Err(error) = driver.set_illuminator(self.brightness) {
                        self.calibrator_fault(error, events);
                    }
                }
            }
            _ => {}
        }
    }

    fn apply_brightness(&mut self, driver: &mut dyn ActuatorDriver, events: &mut Vec<EngineEvent>) {
        self.brightness_changed = false;
        match driver.set_illuminator(self.brightness) {
            Ok(()) => {
                self.stabilize_remaining = self.config.calibrator_stabilize_ticks.max(1);
                self.set_calibrator_state(CalibratorState::NotReady, events);
            }
            Err(error) => self.calibrator_fault(error, events),
        }
    }

    fn halt_pending(&self) -> bool {
        self.target_cover_state == CoverState::Halted
    }

    fn cover_available(&self) -> Result<(), RequestError> {
        match self.cover_state {
            CoverState::NotPresent => Err(RequestError::NotPresent(Axis::Cover)),
            CoverState::Error => Err(RequestError::Faulted(Axis::Cover)),
            _ => Ok(()),
        }
    }

    fn calibrator_available(&self) -> Result<(), RequestError> {
        match self.calibrator_state {
            CalibratorState::NotPresent => Err(RequestError::NotPresent(Axis::Calibrator)),
            CalibratorState::Error => Err(RequestError::Faulted(Axis::Calibrator)),
            _ => Ok(()),
        }
    }

    fn cover_reconfigurable(&self) -> Result<(), RequestError> {
        if self.cover_state == CoverState::NotPresent {
            return Err(RequestError::NotPresent(Axis::Cover));
        }
        if self.is_moving() {
            return Err(RequestError::CoverMoving);
        }
        Ok(())
    }

    /// `Open` and `Closed` only hold while every flap sits on the matching
    /// bound; anything else drops to `Unknown` so the next request moves.
    fn after_flap_reconfiguration(&mut self) {
        self.resync_flaps = true;
        let settled = match self.cover_state {
            CoverState::Error => false,
            state @ (CoverState::Open | CoverState::Closed) => {
                self.flaps.all_at(|flap| goal_for(flap, state))
            }
            _ => true,
        };
        if !settled {
            self.cover_state = CoverState::Unknown;
            self.target_cover_state = CoverState::Unknown;
        }
    }

    fn write_all_positions(&self, driver: &mut dyn ActuatorDriver) -> Result<(), ActuatorError> {
        self.flaps
            .iter()
            .enumerate()
            .try_for_each(|(index, flap)| driver.set_flap_position(index, flap.position()))
    }

    fn set_servo_power(
        &mut self,
        driver: &mut dyn ActuatorDriver,
        enabled: bool,
    ) -> Result<(), ActuatorError> {
        if self.servo_power != enabled {
            driver.set_power(enabled)?;
            self.servo_power = enabled;
        }
        Ok(())
    }

    fn cover_fault(
        &mut self,
        driver: &mut dyn ActuatorDriver,
        error: ActuatorError,
        events: &mut Vec<EngineEvent>,
    ) {
        events.push(EngineEvent::ActuatorFault {
            axis: Axis::Cover,
            error,
        });
        self.motion = None;
        if driver.set_power(false).is_ok() {
            self.servo_power = false;
        }
        self.target_cover_state = CoverState::Error;
        self.set_cover_state(CoverState::Error, events);
    }

    fn calibrator_fault(&mut self, error: ActuatorError, events: &mut Vec<EngineEvent>) {
        events.push(EngineEvent::ActuatorFault {
            axis: Axis::Calibrator,
            error,
        });
        self.brightness_changed = false;
        self.target_calibrator_state = CalibratorState::Error;
        self.set_calibrator_state(CalibratorState::Error, events);
    }

    fn set_cover_state(&mut self, to: CoverState, events: &mut Vec<EngineEvent>) {
        if self.cover_state != to {
            events.push(EngineEvent::CoverStateChanged {
                from: self.cover_state,
                to,
            });
            self.cover_state = to;
        }
    }

    fn set_calibrator_state(&mut self, to: CalibratorState, events: &mut Vec<EngineEvent>) {
        if self.calibrator_state != to {
            events.push(EngineEvent::CalibratorStateChanged {
                from: self.calibrator_state,
                to,
            });
            self.calibrator_state = to;
        }
    }
}

fn goal_for(flap: &Flap, target: CoverState) -> u8 {
    if target == CoverState::Open {
        flap.max_limit()
    } else {
        flap.min_limit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::SimulatedActuator;
    use crate::config::ServoTopology;
    use pretty_assertions::assert_eq;

    fn engine_with(flaps: Vec<FlapLimits>, movement: FlapMovement) -> CoverCalibratorEngine {
        let mut config = RuntimeConfig::default();
        config.settings.flaps = flaps;
        config.motion.movement = movement;
        CoverCalibratorEngine::new(&config)
    }

    fn single_flap() -> CoverCalibratorEngine {
        engine_with(vec![FlapLimits::new(30, 150).unwrap()], FlapMovement::EachFlapInSequence)
    }

    fn assert_within_limits(engine: &CoverCalibratorEngine) {
        for flap in engine.flaps().iter() {
            assert!(flap.min_limit() <= flap.position() && flap.position() <= flap.max_limit());
        }
    }

    fn run_until(
        engine: &mut CoverCalibratorEngine,
        driver: &mut SimulatedActuator,
        max_ticks: usize,
        done: impl Fn(&CoverCalibratorEngine) -> bool,
    ) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        for _ in 0..max_ticks {
            events.extend(engine.tick(driver));
            assert_within_limits(engine);
            if done(engine) {
                return events;
            }
        }
        panic!("condition not reached within {max_ticks} ticks");
    }

    #[test]
    fn opens_single_flap_from_min_to_max() {
        let mut engine = single_flap();
        let mut driver = SimulatedActuator::new(1);
        assert!(engine.sync_outputs(&mut driver).is_empty());
        assert_eq!(driver.position(0), Some(30));

        engine.open_cover().unwrap();
        assert_eq!(engine.target_cover_state(), CoverState::Open);

        engine.tick(&mut driver);
        assert_eq!(engine.cover_state(), CoverState::Moving);
        assert!(driver.power());

        let events = run_until(&mut engine, &mut driver, 1_000, |engine| {
            engine.cover_state() == CoverState::Open
        });

        assert_eq!(engine.flaps().get(0).unwrap().position(), 150);
        assert_eq!(driver.position(0), Some(150));
        assert!(!driver.power());
        assert!(events.contains(&EngineEvent::CoverStateChanged {
            from: CoverState::Moving,
            to: CoverState::Open,
        }));
    }

    #[test]
    fn calibrator_on_stabilizes_to_ready() {
        let mut engine = single_flap();
        let mut driver = SimulatedActuator::new(1);

        engine.calibrator_on(500).unwrap();
        engine.tick(&mut driver);
        assert_eq!(engine.calibrator_state(), CalibratorState::NotReady);
        assert_eq!(driver.illuminator(), 500);

        for _ in 0..99 {
            engine.tick(&mut driver);
            assert_eq!(engine.calibrator_state(), CalibratorState::NotReady);
            assert_eq!(driver.illuminator(), 500);
        }
        engine.tick(&mut driver);
        assert_eq!(engine.calibrator_state(), CalibratorState::Ready);
        assert_eq!(driver.illuminator(), 500);
    }

    #[test]
    fn brightness_change_while_ready_stays_ready() {
        let mut engine = single_flap();
        let mut driver = SimulatedActuator::new(1);
        engine.calibrator_on(500).unwrap();
        for _ in 0..101 {
            engine.tick(&mut driver);
        }
        assert_eq!(engine.calibrator_state(), CalibratorState::Ready);

        engine.calibrator_on(800).unwrap();
        engine.tick(&mut driver);
        assert_eq!(engine.calibrator_state(), CalibratorState::Ready);
        assert_eq!(driver.illuminator(), 800);

        engine.calibrator_off().unwrap();
        engine.tick(&mut driver);
        assert_eq!(engine.calibrator_state(), CalibratorState::Off);
        assert_eq!(driver.illuminator(), 0);
    }

    #[test]
    fn halt_resolves_through_halted_to_unknown() {
        let mut engine = single_flap();
        let mut driver = SimulatedActuator::new(1);
        engine.open_cover().unwrap();
        for _ in 0..40 {
            engine.tick(&mut driver);
        }
        assert_eq!(engine.cover_state(), CoverState::Moving);
        let frozen = engine.flaps().get(0).unwrap().position();
        assert!(frozen > 30 && frozen < 150);

        engine.halt_cover().unwrap();
        engine.tick(&mut driver);
        assert_eq!(engine.cover_state(), CoverState::Halted);
        assert_eq!(engine.cover_state().reported(), CoverState::Moving);

        engine.tick(&mut driver);
        assert_eq!(engine.cover_state(), CoverState::Unknown);
        assert!(!driver.power());

        for _ in 0..50 {
            engine.tick(&mut driver);
            assert_eq!(engine.cover_state(), CoverState::Unknown);
        }
        assert_eq!(engine.flaps().get(0).unwrap().position(), frozen);
    }

    #[test]
    fn halt_while_idle_is_a_no_op() {
        let mut engine = single_flap();
        let mut driver = SimulatedActuator::new(1);
        engine.halt_cover().unwrap();
        assert_eq!(engine.target_cover_state(), CoverState::Closed);
        engine.tick(&mut driver);
        assert_eq!(engine.cover_state(), CoverState::Closed);
    }

    #[test]
    fn close_when_closed_does_not_touch_actuators() {
        let mut engine = single_flap();
        let mut driver = SimulatedActuator::new(1);
        engine.close_cover().unwrap();
        for _ in 0..20 {
            assert!(engine.tick(&mut driver).is_empty());
        }
        assert_eq!(engine.cover_state(), CoverState::Closed);
        assert_eq!(driver.position_writes(), 0);
        assert!(!driver.power());
    }

    #[test]
    fn reversal_mid_travel_retargets() {
        let mut engine = single_flap();
        let mut driver = SimulatedActuator::new(1);
        engine.open_cover().unwrap();
        for _ in 0..40 {
            engine.tick(&mut driver);
        }
        engine.close_cover().unwrap();
        run_until(&mut engine, &mut driver, 1_000, |engine| {
            engine.cover_state() == CoverState::Closed
        });
        assert_eq!(driver.position(0), Some(30));
    }

    #[test]
    fn sequence_moves_one_flap_at_a_time() {
        let mut engine = engine_with(
            vec![FlapLimits::new(30, 40).unwrap(), FlapLimits::new(30, 40).unwrap()],
            FlapMovement::EachFlapInSequence,
        );
        let mut driver = SimulatedActuator::new(2);
        engine.open_cover().unwrap();
        for _ in 0..24 {
            engine.tick(&mut driver);
        }
        assert!(engine.flaps().get(0).unwrap().position() > 30);
        assert_eq!(engine.flaps().get(1).unwrap().position(), 30);

        run_until(&mut engine, &mut driver, 500, |engine| {
            engine.cover_state() == CoverState::Open
        });
        assert_eq!(driver.position(1), Some(40));
    }

    #[test]
    fn incremental_moves_all_flaps_each_tick() {
        let mut engine = engine_with(
            vec![FlapLimits::new(30, 40).unwrap(), FlapLimits::new(50, 60).unwrap()],
            FlapMovement::EachFlapIncremental,
        );
        let mut driver = SimulatedActuator::new(2);
        engine.open_cover().unwrap();
        for _ in 0..22 {
            engine.tick(&mut driver);
        }
        assert_eq!(engine.flaps().get(0).unwrap().position(), 32);
        assert_eq!(engine.flaps().get(1).unwrap().position(), 52);
    }

    #[test]
    fn all_at_once_waits_for_settle_time() {
        let mut engine = engine_with(
            vec![FlapLimits::new(30, 150).unwrap(), FlapLimits::new(20, 100).unwrap()],
            FlapMovement::AllFlapsAtOnce,
        );
        let mut driver = SimulatedActuator::new(2);
        engine.open_cover().unwrap();
        for _ in 0..23 {
            engine.tick(&mut driver);
        }
        assert_eq!(driver.position(0), Some(150));
        assert_eq!(driver.position(1), Some(100));
        assert_eq!(engine.cover_state(), CoverState::Moving);

        run_until(&mut engine, &mut driver, 300, |engine| {
            engine.cover_state() == CoverState::Open
        });
        assert_eq!(driver.position_writes(), 2);
    }

    #[test]
    fn watchdog_moves_stalled_cover_to_error() {
        let mut config = RuntimeConfig::default();
        config.motion.max_motion_ticks = 30;
        let mut engine = CoverCalibratorEngine::new(&config);
        let mut driver = SimulatedActuator::new(1);

        engine.open_cover().unwrap();
        let events = run_until(&mut engine, &mut driver, 100, |engine| {
            engine.cover_state() == CoverState::Error
        });

        assert!(events.contains(&EngineEvent::WatchdogTripped { ticks: 31 }));
        assert!(!driver.power());
        assert!(!engine.servo_power());
        assert_eq!(
            engine.open_cover(),
            Err(RequestError::Faulted(Axis::Cover))
        );

        engine.set_flap_limits(0, FlapLimits::default()).unwrap();
        assert_eq!(engine.cover_state(), CoverState::Unknown);
    }

    #[test]
    fn servo_fault_moves_cover_to_error() {
        let mut engine = single_flap();
        let mut driver = SimulatedActuator::new(1);
        driver.fail_flap(Some(0));

        engine.open_cover().unwrap();
        let events = run_until(&mut engine, &mut driver, 100, |engine| {
            engine.cover_state() == CoverState::Error
        });

        assert!(events.iter().any(|event| matches!(
            event,
            EngineEvent::ActuatorFault {
                axis: Axis::Cover,
                ..
            }
        )));
        assert!(!driver.power());
        assert_eq!(engine.calibrator_state(), CalibratorState::Off);
    }

    #[test]
    fn illuminator_fault_only_affects_calibrator() {
        let mut engine = single_flap();
        let mut driver = SimulatedActuator::new(1);
        driver.fail_illuminator(true);

        engine.calibrator_on(100).unwrap();
        engine.tick(&mut driver);
        assert_eq!(engine.calibrator_state(), CalibratorState::Error);
        assert_eq!(engine.calibrator_on(10), Err(RequestError::Faulted(Axis::Calibrator)));
        assert!(engine.open_cover().is_ok());

        driver.fail_illuminator(false);
        engine.configure_calibrator(200, false).unwrap();
        assert_eq!(engine.calibrator_state(), CalibratorState::Off);
        assert_eq!(engine.brightness(), 200);
    }

    #[test]
    fn absent_axes_reject_requests() {
        let mut config = RuntimeConfig::default();
        config.hardware.cover_present = false;
        config.hardware.calibrator_present = false;
        let mut engine = CoverCalibratorEngine::new(&config);

        assert_eq!(engine.cover_state(), CoverState::NotPresent);
        assert_eq!(engine.open_cover(), Err(RequestError::NotPresent(Axis::Cover)));
        assert_eq!(
            engine.calibrator_on(10),
            Err(RequestError::NotPresent(Axis::Calibrator))
        );
        assert_eq!(engine.set_flap_count(2), Err(RequestError::NotPresent(Axis::Cover)));
    }

    #[test]
    fn flap_reconfiguration_rejected_while_moving() {
        let mut engine = single_flap();
        let mut driver = SimulatedActuator::new(4);
        engine.open_cover().unwrap();
        engine.tick(&mut driver);

        assert_eq!(engine.set_flap_count(3), Err(RequestError::CoverMoving));

        run_until(&mut engine, &mut driver, 1_000, |engine| {
            engine.cover_state() == CoverState::Open
        });
        engine.set_flap_count(3).unwrap();
        engine.tick(&mut driver);
        assert_eq!(driver.position(2), Some(150));
    }

    #[test]
    fn watchdog_reports_failed_power_off() {
        let mut config = RuntimeConfig::default();
        config.motion.max_motion_ticks = 30;
        let mut engine = CoverCalibratorEngine::new(&config);
        let mut driver = SimulatedActuator::new(1);

        engine.open_cover().unwrap();
        engine.tick(&mut driver);
        assert!(driver.power());
        driver.fail_power(true);

        let events = run_until(&mut engine, &mut driver, 100, |engine| {
            engine.cover_state() == CoverState::Error
        });
        assert!(events.iter().any(|event| matches!(
            event,
            EngineEvent::ActuatorFault {
                axis: Axis::Cover,
                ..
            }
        )));
        assert!(engine.servo_power());
    }

    #[test]
    fn widening_limits_of_open_cover_makes_it_unknown() {
        let mut engine = single_flap();
        let mut driver = SimulatedActuator::new(1);
        engine.open_cover().unwrap();
        run_until(&mut engine, &mut driver, 1_000, |engine| {
            engine.cover_state() == CoverState::Open
        });

        engine.set_flap_limits(0, FlapLimits::new(30, 170).unwrap()).unwrap();
        assert_eq!(engine.cover_state(), CoverState::Unknown);
        assert_eq!(engine.target_cover_state(), CoverState::Unknown);

        engine.open_cover().unwrap();
        run_until(&mut engine, &mut driver, 1_000, |engine| {
            engine.cover_state() == CoverState::Open
        });
        assert_eq!(engine.flaps().get(0).unwrap().position(), 170);
        assert_eq!(driver.position(0), Some(170));
    }

    #[test]
    fn narrowing_limits_of_closed_cover_keeps_it_closed() {
        let mut engine = single_flap();
        let mut driver = SimulatedActuator::new(1);

        engine.set_flap_limits(0, FlapLimits::new(40, 150).unwrap()).unwrap();
        assert_eq!(engine.cover_state(), CoverState::Closed);
        engine.tick(&mut driver);
        assert_eq!(driver.position(0), Some(40));

        engine.set_flap_limits(0, FlapLimits::new(20, 150).unwrap()).unwrap();
        assert_eq!(engine.cover_state(), CoverState::Unknown);
    }

    #[test]
    fn flap_count_is_capped_by_servo_channels() {
        let mut config = RuntimeConfig::default();
        config.hardware.topology = ServoTopology::DirectPins { pins: vec![4, 5] };
        let mut engine = CoverCalibratorEngine::new(&config);
        assert_eq!(engine.servo_channels(), 2);

        assert_eq!(
            engine.set_flap_count(3),
            Err(RequestError::Flap(FlapError::CountOutOfRange { count: 3, max: 2 }))
        );
        assert_eq!(engine.flaps().len(), 1);

        engine.set_flap_count(2).unwrap();
        let mut driver = SimulatedActuator::new(2);
        engine.open_cover().unwrap();
        run_until(&mut engine, &mut driver, 2_000, |engine| {
            engine.cover_state() == CoverState::Open
        });
    }
}
