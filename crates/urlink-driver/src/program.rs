//! Control programs uploaded over the primary channel.
//!
//! The servo program is a template: `{driver_hostname}` and
//! `{driver_reverseport}` are substituted with the address the program must
//! connect back to. Its message codes and scale factors mirror
//! `urlink_codec::reverse`.

/// Returns the controller to an idle, programmable state.
pub const RESET_PROGRAM: &str = "def resetProg():\n  sleep(0.0)\nend\n";

/// Switches the arm into hand-guided free-drive mode.
pub const FREE_DRIVE_PROGRAM: &str = "def freedriveProg():\n  set robotmode freedrive\nend\n";

pub const HOST_PLACEHOLDER: &str = "{driver_hostname}";
pub const PORT_PLACEHOLDER: &str = "{driver_reverseport}";

/// Built-in servo program. Streams joint states and the tool pose back to
/// the driver and executes the motion commands it receives.
pub const SERVO_PROGRAM_TEMPLATE: &str = r#"def driverProg():
  MSG_OUT = 1
  MSG_QUIT = 2
  MSG_JOINT_STATES = 3
  MSG_MOVEJ = 4
  MSG_WAYPOINT_FINISHED = 5
  MSG_STOPJ = 6
  MSG_SERVOJ = 7
  MSG_MOVEL = 8
  MSG_TCP_STATE = 9
  MULT_jointstate = 10000.0
  MULT_time = 1000000.0
  MULT_blend = 1000.0

  SERVO_IDLE = 0
  SERVO_RUNNING = 1
  cmd_servo_state = SERVO_IDLE
  cmd_servo_id = 0
  cmd_servo_q = get_joint_positions()
  cmd_servo_t = 0.008

  def send_out(msg):
    enter_critical
    socket_send_int(MSG_OUT)
    socket_send_string(msg)
    socket_send_string("~")
    exit_critical
  end

  def send_waypoint_finished(waypoint_id):
    enter_critical
    socket_send_int(MSG_WAYPOINT_FINISHED)
    socket_send_int(waypoint_id)
    exit_critical
  end

  def set_servo_setpoint(id, q, t):
    enter_critical
    cmd_servo_state = SERVO_RUNNING
    cmd_servo_id = id
    cmd_servo_q = q
    cmd_servo_t = t
    exit_critical
  end

  thread servoThread():
    state = SERVO_IDLE
    while True:
      enter_critical
      q = cmd_servo_q
      t = cmd_servo_t
      do_brake = False
      if (state == SERVO_RUNNING) and (cmd_servo_state == SERVO_IDLE):
        do_brake = True
      end
      state = cmd_servo_state
      cmd_servo_state = SERVO_IDLE
      exit_critical
      if do_brake:
        stopj(1.0)
        sync()
      elif state == SERVO_RUNNING:
        servoj(q, 0, 0, t)
      else:
        sync()
      end
    end
  end

  thread stateThread():
    while True:
      q = get_joint_positions()
      qdot = get_joint_speeds()
      tau = get_joint_torques()
      enter_critical
      socket_send_int(MSG_JOINT_STATES)
      socket_send_int(floor(MULT_jointstate * q[0] + 0.5))
      socket_send_int(floor(MULT_jointstate * q[1] + 0.5))
      socket_send_int(floor(MULT_jointstate * q[2] + 0.5))
      socket_send_int(floor(MULT_jointstate * q[3] + 0.5))
      socket_send_int(floor(MULT_jointstate * q[4] + 0.5))
      socket_send_int(floor(MULT_jointstate * q[5] + 0.5))
      socket_send_int(floor(MULT_jointstate * qdot[0] + 0.5))
      socket_send_int(floor(MULT_jointstate * qdot[1] + 0.5))
      socket_send_int(floor(MULT_jointstate * qdot[2] + 0.5))
      socket_send_int(floor(MULT_jointstate * qdot[3] + 0.5))
      socket_send_int(floor(MULT_jointstate * qdot[4] + 0.5))
      socket_send_int(floor(MULT_jointstate * qdot[5] + 0.5))
      socket_send_int(floor(MULT_jointstate * tau[0] + 0.5))
      socket_send_int(floor(MULT_jointstate * tau[1] + 0.5))
      socket_send_int(floor(MULT_jointstate * tau[2] + 0.5))
      socket_send_int(floor(MULT_jointstate * tau[3] + 0.5))
      socket_send_int(floor(MULT_jointstate * tau[4] + 0.5))
      socket_send_int(floor(MULT_jointstate * tau[5] + 0.5))
      p = get_actual_tcp_pose()
      socket_send_int(MSG_TCP_STATE)
      socket_send_int(floor(MULT_jointstate * p[0] + 0.5))
      socket_send_int(floor(MULT_jointstate * p[1] + 0.5))
      socket_send_int(floor(MULT_jointstate * p[2] + 0.5))
      socket_send_int(floor(MULT_jointstate * p[3] + 0.5))
      socket_send_int(floor(MULT_jointstate * p[4] + 0.5))
      socket_send_int(floor(MULT_jointstate * p[5] + 0.5))
      exit_critical
      sync()
    end
  end

  socket_open("{driver_hostname}", {driver_reverseport})
  send_out("hello")

  thread_servo = run servoThread()
  thread_state = run stateThread()

  while True:
    params_mult = socket_read_binary_integer(1)
    if params_mult[0] > 0:
      mtype = params_mult[1]
      if mtype == MSG_QUIT:
        send_out("Received QUIT")
        break
      elif mtype == MSG_SERVOJ:
        params_mult = socket_read_binary_integer(1+6+1)
        waypoint_id = params_mult[1]
        q = [params_mult[2] / MULT_jointstate, params_mult[3] / MULT_jointstate, params_mult[4] / MULT_jointstate, params_mult[5] / MULT_jointstate, params_mult[6] / MULT_jointstate, params_mult[7] / MULT_jointstate]
        t = params_mult[8] / MULT_time
        set_servo_setpoint(waypoint_id, q, t)
      elif mtype == MSG_MOVEJ:
        params_mult = socket_read_binary_integer(1+6+4)
        waypoint_id = params_mult[1]
        q = [params_mult[2] / MULT_jointstate, params_mult[3] / MULT_jointstate, params_mult[4] / MULT_jointstate, params_mult[5] / MULT_jointstate, params_mult[6] / MULT_jointstate, params_mult[7] / MULT_jointstate]
        a = params_mult[8] / MULT_jointstate
        v = params_mult[9] / MULT_jointstate
        t = params_mult[10] / MULT_time
        r = params_mult[11] / MULT_blend
        movej(q, a, v, t, r)
        send_waypoint_finished(waypoint_id)
      elif mtype == MSG_MOVEL:
        params_mult = socket_read_binary_integer(1+6)
        waypoint_id = params_mult[1]
        pose = p[params_mult[2] / MULT_jointstate, params_mult[3] / MULT_jointstate, params_mult[4] / MULT_jointstate, params_mult[5] / MULT_jointstate, params_mult[6] / MULT_jointstate, params_mult[7] / MULT_jointstate]
        movel(pose)
        send_waypoint_finished(waypoint_id)
      elif mtype == MSG_STOPJ:
        enter_critical
        cmd_servo_state = SERVO_IDLE
        exit_critical
        stopj(1.0)
      end
    end
  end

  sleep(1)
  socket_send_int(MSG_QUIT)
  kill thread_servo
  kill thread_state
  socket_close()
end
"#;

/// Substitute the driver's reachable address into `template`.
pub fn render_program(template: &str, driver_host: &str, reverse_port: u16) -> String {
    template
        .replace(HOST_PLACEHOLDER, driver_host)
        .replace(PORT_PLACEHOLDER, &reverse_port.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_fills_every_placeholder() {
        let program = render_program(SERVO_PROGRAM_TEMPLATE, "10.0.0.7", 50001);
        assert!(program.contains(r#"socket_open("10.0.0.7", 50001)"#));
        assert!(!program.contains(HOST_PLACEHOLDER));
        assert!(!program.contains(PORT_PLACEHOLDER));
    }

    #[test]
    fn builtin_program_agrees_with_codec_constants() {
        use urlink_codec::reverse::*;
        for (name, code) in [
            ("MSG_OUT", MSG_OUT),
            ("MSG_QUIT", MSG_QUIT),
            ("MSG_JOINT_STATES", MSG_JOINT_STATES),
            ("MSG_MOVEJ", MSG_MOVEJ),
            ("MSG_WAYPOINT_FINISHED", MSG_WAYPOINT_FINISHED),
            ("MSG_STOPJ", MSG_STOPJ),
            ("MSG_SERVOJ", MSG_SERVOJ),
            ("MSG_MOVEL", MSG_MOVEL),
            ("MSG_TCP_STATE", MSG_TCP_STATE),
        ] {
            let line = format!("{name} = {code}\n");
            assert!(SERVO_PROGRAM_TEMPLATE.contains(&line), "missing `{line}`");
        }
        assert!(SERVO_PROGRAM_TEMPLATE.contains("MULT_jointstate = 10000.0"));
        assert!(SERVO_PROGRAM_TEMPLATE.contains("MULT_time = 1000000.0"));
        assert!(SERVO_PROGRAM_TEMPLATE.contains("MULT_blend = 1000.0"));
    }

    #[test]
    fn builtin_program_rounds_like_the_driver() {
        let sends: Vec<&str> = SERVO_PROGRAM_TEMPLATE
            .lines()
            .filter(|line| line.contains("socket_send_int(floor("))
            .collect();
        assert_eq!(sends.len(), 24);
        for line in sends {
            assert!(line.trim_end().ends_with(" + 0.5))"), "not rounded half up: {line}");
        }
    }

    #[test]
    fn fallback_programs_are_single_functions() {
        assert!(RESET_PROGRAM.starts_with("def resetProg():"));
        assert!(FREE_DRIVE_PROGRAM.contains("set robotmode freedrive"));
    }
}
