use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomAssignment {
    pub student_id: String,
    pub room_id: String,
}

/// Deals students into rooms in turn: student `i` lands in room `i mod N`, so
/// room sizes never differ by more than one.
pub fn round_robin(students: &[String], rooms: &[String]) -> Vec<RoomAssignment> {
    if rooms.is_empty() {
        return Vec::new();
    }
    students
        .iter()
        .enumerate()
        .map(|(index, student_id)| RoomAssignment {
            student_id: student_id.clone(),
            room_id: rooms[index % rooms.len()].clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ids(prefix: &str, count: usize) -> Vec<String> {
        (0..count).map(|i| format!("{prefix}{i}")).collect()
    }

    #[test]
    fn seven_students_into_three_rooms() {
        let rooms = ids("room", 3);
        let assignments = round_robin(&ids("s", 7), &rooms);
        let order: Vec<&str> = assignments.iter().map(|a| a.room_id.as_str()).collect();
        assert_eq!(
            order,
            ["room0", "room1", "room2", "room0", "room1", "room2", "room0"]
        );
    }

    #[test]
    fn sizes_are_floor_or_ceil() {
        for students in 0..20 {
            for room_count in 1..8 {
                let rooms = ids("r", room_count);
                let mut sizes: HashMap<String, usize> = HashMap::new();
                for a in round_robin(&ids("s", students), &rooms) {
                    *sizes.entry(a.room_id).or_default() += 1;
                }
                let floor = students / room_count;
                let ceil = students.div_ceil(room_count);
                for room in &rooms {
                    let size = sizes.get(room).copied().unwrap_or(0);
                    assert!(size == floor || size == ceil, "{students}/{room_count}: {size}");
                }
            }
        }
    }

    #[test]
    fn no_rooms_means_no_assignments() {
        assert!(round_robin(&ids("s", 4), &[]).is_empty());
    }
}
